//! Single-file entry point: checkpoint bookkeeping, overwrite policy, and
//! file-level status events around one parallel transfer.

use std::path::Path;
use std::sync::Arc;

use rayon::ThreadPool;

use crate::config::TransferProperties;
use crate::control::{ForceOption, TransferControlBlock};
use crate::errors::{RestartFault, TransferFault, TransferResult};
use crate::restart::{FileRestartInfo, FileRestartInfoIdentifier, RemoteFileAccess, RestartManager, RestartProcessor, RestartType};
use crate::session::NegotiatedSession;
use crate::status::{CallbackResponse, TransferState, TransferStatus, TransferStatusCallbackListener, TransferType};
use crate::strategy::ParallelTransferStrategy;
use crate::worker::RestartTracking;

pub struct ParallelFileTransfer {
    session: NegotiatedSession,
    properties: TransferProperties,
    control: Arc<TransferControlBlock>,
    listener: Option<Arc<dyn TransferStatusCallbackListener>>,
    account_identifier: String,
    restart_manager: Option<Arc<dyn RestartManager>>,
    remote: Option<Arc<dyn RemoteFileAccess>>,
    pool: Option<Arc<ThreadPool>>,
}

/// Paths and size of the file being moved, oriented by direction.
struct FileEvent {
    transfer_type: TransferType,
    source: String,
    target: String,
    length: u64,
}

enum Overwrite {
    Proceed,
    Skip,
}

impl ParallelFileTransfer {
    pub fn new(session: NegotiatedSession, properties: TransferProperties, control: Arc<TransferControlBlock>) -> Self {
        Self {
            session,
            properties,
            control,
            listener: None,
            account_identifier: String::new(),
            restart_manager: None,
            remote: None,
            pool: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransferStatusCallbackListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Checkpoints are keyed by `account_identifier` plus the remote path.
    pub fn with_restart_manager(mut self, account_identifier: impl Into<String>, manager: Arc<dyn RestartManager>) -> Self {
        self.account_identifier = account_identifier.into();
        self.restart_manager = Some(manager);
        self
    }

    /// Enables resuming an existing checkpoint instead of starting over.
    pub fn with_remote_access(mut self, remote: Arc<dyn RemoteFileAccess>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn control(&self) -> &Arc<TransferControlBlock> {
        &self.control
    }

    /// Send `local_file` to `irods_absolute_path`.
    pub fn put(&self, local_file: &Path, irods_absolute_path: &str) -> TransferResult<()> {
        let length = std::fs::metadata(local_file)
            .map_err(|err| TransferFault::transport(format!("reading {}", local_file.display()), err))?
            .len();
        let event = FileEvent {
            transfer_type: TransferType::Put,
            source: local_file.display().to_string(),
            target: irods_absolute_path.to_string(),
            length,
        };
        self.run(&event, local_file, irods_absolute_path)
    }

    /// Receive `length` bytes of `irods_absolute_path` into `local_file`.
    pub fn get(&self, irods_absolute_path: &str, local_file: &Path, length: u64) -> TransferResult<()> {
        let event = FileEvent {
            transfer_type: TransferType::Get,
            source: irods_absolute_path.to_string(),
            target: local_file.display().to_string(),
            length,
        };
        self.run(&event, local_file, irods_absolute_path)
    }

    fn run(&self, event: &FileEvent, local_file: &Path, irods_absolute_path: &str) -> TransferResult<()> {
        self.session.validate()?;
        if irods_absolute_path.is_empty() {
            return Err(TransferFault::Configuration("empty irods absolute path".into()));
        }
        if self.control.total_files_to_transfer() == 0 {
            self.control.set_total_files_to_transfer(1);
        }
        if self.control.total_bytes_to_transfer() == 0 {
            self.control.set_total_bytes_to_transfer(event.length);
        }
        self.overall(event, TransferState::OverallInitiation);
        self.notify(event, TransferState::InProgressStartFile, 0);

        let restart_type = match event.transfer_type {
            TransferType::Get => RestartType::Get,
            _ => RestartType::Put,
        };
        let tracking = match self.restart_tracking(irods_absolute_path, restart_type) {
            Ok(Some((tracking, true))) => return self.resume(event, irods_absolute_path, restart_type, &tracking),
            Ok(Some((tracking, false))) => Some(tracking),
            Ok(None) => None,
            Err(fault) => return self.fail(event, fault),
        };

        if event.transfer_type == TransferType::Get && local_file.exists() {
            match self.confirm_overwrite(local_file) {
                Ok(Overwrite::Proceed) => {
                    log::info!("overwriting {}", local_file.display());
                }
                Ok(Overwrite::Skip) => {
                    log::info!("skipping existing {}", local_file.display());
                    self.control.increment_files_skipped_so_far();
                    self.notify(event, TransferState::Skipping, 0);
                    self.overall(event, TransferState::OverallCompletion);
                    return Ok(());
                }
                Err(fault) => return self.fail(event, fault),
            }
        }

        if let Some(tracking) = &tracking {
            if let Err(fault) = self.begin_checkpoint(tracking, local_file, event.length) {
                return self.fail(event, fault);
            }
        }

        let strategy = match event.transfer_type {
            TransferType::Get => {
                ParallelTransferStrategy::get(self.session.clone(), local_file, event.length, Arc::clone(&self.control))
            }
            _ => ParallelTransferStrategy::put(self.session.clone(), local_file, Arc::clone(&self.control)),
        }
        .with_properties(self.properties.clone())
        .with_irods_absolute_path(irods_absolute_path);
        let strategy = match &self.listener {
            Some(listener) => strategy.with_listener(Arc::clone(listener)),
            None => strategy,
        };
        let strategy = match &self.pool {
            Some(pool) => strategy.with_thread_pool(Arc::clone(pool)),
            None => strategy,
        };
        let strategy = match &tracking {
            Some(tracking) => strategy.with_restart(tracking.clone()),
            None => strategy,
        };

        match strategy.execute() {
            Ok(summary) => {
                log::info!(
                    "{:?} {} -> {} complete ({} bytes)",
                    event.transfer_type,
                    event.source,
                    event.target,
                    summary.bytes_transferred
                );
                if let Some(tracking) = &tracking {
                    if let Err(fault) = tracking.manager.delete_restart(&tracking.identifier) {
                        return self.fail(event, fault.into());
                    }
                }
                self.succeed(event);
                Ok(())
            }
            Err(fault) => {
                if let Some(tracking) = &tracking {
                    log::info!("keeping checkpoint {} for a later restart", tracking.identifier);
                }
                self.fail(event, fault)
            }
        }
    }

    /// Returns the tracking for this file and whether a checkpoint should be
    /// resumed rather than started fresh.
    fn restart_tracking(
        &self,
        irods_absolute_path: &str,
        restart_type: RestartType,
    ) -> TransferResult<Option<(RestartTracking, bool)>> {
        if !self.properties.long_transfer_restart {
            return Ok(None);
        }
        let manager = self.restart_manager.clone().ok_or_else(|| {
            log::error!("long transfer restart enabled without a restart manager");
            RestartFault::NotConfigured
        })?;
        let identifier = FileRestartInfoIdentifier::new(self.account_identifier.clone(), irods_absolute_path, restart_type);
        let resume = self.remote.is_some() && manager.retrieve_restart(&identifier)?.is_some();
        Ok(Some((RestartTracking { manager, identifier }, resume)))
    }

    /// A fresh run moves every byte again, so any earlier record is replaced
    /// by one with a segment per thread of this session. Only the attempt
    /// count carries over.
    fn begin_checkpoint(&self, tracking: &RestartTracking, local_file: &Path, length: u64) -> TransferResult<()> {
        let manager = &tracking.manager;
        let mut info = FileRestartInfo::new(
            &tracking.identifier,
            local_file,
            length,
            self.session.number_of_threads,
        );
        if let Some(previous) = manager.retrieve_restart(&tracking.identifier)? {
            log::info!(
                "replacing checkpoint {} ({} segments) for a fresh {}-thread run",
                tracking.identifier,
                previous.segments.len(),
                self.session.number_of_threads
            );
            info.restart_attempts = previous.restart_attempts;
        }
        manager.store_restart(&info)?;
        Ok(())
    }

    fn resume(
        &self,
        event: &FileEvent,
        irods_absolute_path: &str,
        restart_type: RestartType,
        tracking: &RestartTracking,
    ) -> TransferResult<()> {
        let Some(remote) = &self.remote else {
            return self.fail(event, RestartFault::NotConfigured.into());
        };
        log::info!("resuming {} from checkpoint", tracking.identifier);
        let manager = Some(Arc::clone(&tracking.manager));
        let processor = match restart_type {
            RestartType::Get => RestartProcessor::get(
                self.account_identifier.clone(),
                manager,
                Arc::clone(remote),
                Arc::clone(&self.control),
                self.properties.clone(),
            ),
            RestartType::Put => RestartProcessor::put(
                self.account_identifier.clone(),
                manager,
                Arc::clone(remote),
                Arc::clone(&self.control),
                self.properties.clone(),
            ),
        };
        let processor = match &self.listener {
            Some(listener) => processor.with_listener(Arc::clone(listener)),
            None => processor,
        };

        if let Err(fault) = processor.restart_if_necessary(irods_absolute_path) {
            return self.fail(event, fault);
        }
        // With a listener the processor reports its own failure and leaves
        // the checkpoint in place.
        match tracking.manager.retrieve_restart(&tracking.identifier) {
            Ok(Some(_)) => {
                self.control.report_error_and_check_threshold();
                self.overall(event, TransferState::OverallCompletion);
                return Ok(());
            }
            Ok(None) => {}
            Err(fault) => return self.fail(event, fault.into()),
        }
        self.control.increment_files_transferred_so_far();
        self.overall(event, TransferState::OverallCompletion);
        Ok(())
    }

    fn confirm_overwrite(&self, local_file: &Path) -> TransferResult<Overwrite> {
        let mut options = self.control.transfer_options().unwrap_or_default();
        match options.force_option {
            ForceOption::UseForce => Ok(Overwrite::Proceed),
            ForceOption::NoForce => Ok(Overwrite::Skip),
            ForceOption::AskCallbackListener => {
                let path = local_file.display().to_string();
                let Some(listener) = &self.listener else {
                    return Err(TransferFault::TargetExists(path));
                };
                match listener.ask_whether_to_force_operation(&path, false) {
                    CallbackResponse::YesThisFile => Ok(Overwrite::Proceed),
                    CallbackResponse::NoThisFile => Ok(Overwrite::Skip),
                    CallbackResponse::YesForAll => {
                        options.force_option = ForceOption::UseForce;
                        self.control.set_transfer_options(Some(options));
                        Ok(Overwrite::Proceed)
                    }
                    CallbackResponse::NoForAll => {
                        options.force_option = ForceOption::NoForce;
                        self.control.set_transfer_options(Some(options));
                        Ok(Overwrite::Skip)
                    }
                    CallbackResponse::Cancel => {
                        self.control.set_cancelled(true);
                        Err(TransferFault::Cancelled)
                    }
                }
            }
        }
    }

    fn succeed(&self, event: &FileEvent) {
        self.control.increment_files_transferred_so_far();
        self.notify(event, TransferState::Success, event.length);
        self.overall(event, TransferState::OverallCompletion);
    }

    /// Records the error and, with a listener, reports it instead of
    /// returning it.
    fn fail(&self, event: &FileEvent, fault: TransferFault) -> TransferResult<()> {
        log::error!("{:?} {} -> {} failed: {fault}", event.transfer_type, event.source, event.target);
        self.control.report_error_and_check_threshold();
        let Some(listener) = &self.listener else {
            return Err(fault);
        };
        let bytes = self.control.total_bytes_transferred_so_far();
        let status = match fault {
            TransferFault::Cancelled => self.status(event, TransferState::Cancelled, bytes),
            fault => TransferStatus::for_exception(
                event.transfer_type,
                event.source.clone(),
                event.target.clone(),
                "",
                event.length,
                bytes,
                self.control.file_counts(),
                fault,
            ),
        };
        match status {
            Ok(status) => {
                listener.status_callback(&status);
            }
            Err(err) => log::warn!("unable to build failure status: {err}"),
        }
        self.overall(event, TransferState::OverallCompletion);
        Ok(())
    }

    fn status(&self, event: &FileEvent, state: TransferState, bytes: u64) -> TransferResult<TransferStatus> {
        TransferStatus::new(
            event.transfer_type,
            event.source.clone(),
            event.target.clone(),
            "",
            event.length,
            bytes,
            self.control.file_counts(),
            state,
        )
    }

    fn notify(&self, event: &FileEvent, state: TransferState, bytes: u64) {
        let Some(listener) = &self.listener else {
            return;
        };
        match self.status(event, state, bytes) {
            Ok(status) => {
                listener.status_callback(&status);
            }
            Err(err) => log::warn!("unable to build {state:?} status: {err}"),
        }
    }

    fn overall(&self, event: &FileEvent, state: TransferState) {
        let Some(listener) = &self.listener else {
            return;
        };
        let bytes = self.control.total_bytes_transferred_so_far();
        match self.status(event, state, bytes) {
            Ok(status) => listener.overall_status_callback(&status),
            Err(err) => log::warn!("unable to build {state:?} status: {err}"),
        }
    }
}

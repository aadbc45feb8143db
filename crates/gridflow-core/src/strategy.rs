//! Fan a single file out over the negotiated number of parallel sockets.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::TransferProperties;
use crate::control::TransferControlBlock;
use crate::errors::{TransferFault, TransferResult};
use crate::session::NegotiatedSession;
use crate::status::{
    IntraFileProgressListener, TransferState, TransferStatus, TransferStatusCallbackListener, TransferType,
};
use crate::worker::{self, ByteRange, RestartTracking, WorkerContext, WorkerKind, WorkerOutcome};

/// Split `[0, total)` into `threads` contiguous ranges; the last range takes
/// the remainder.
pub fn partition_ranges(total: u64, threads: usize) -> Vec<ByteRange> {
    if threads == 0 {
        return Vec::new();
    }
    let n = threads as u64;
    let per_thread = total / n;
    (0..n)
        .map(|i| {
            let offset = i * per_thread;
            let length = if i == n - 1 { total - offset } else { per_thread };
            ByteRange { offset, length }
        })
        .collect()
}

/// What the workers achieved together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes_transferred: u64,
    pub workers: usize,
}

pub struct ParallelTransferStrategy {
    transfer_type: TransferType,
    session: NegotiatedSession,
    local_file: PathBuf,
    irods_absolute_path: String,
    total_length: Option<u64>,
    control: Arc<TransferControlBlock>,
    properties: TransferProperties,
    listener: Option<Arc<dyn TransferStatusCallbackListener>>,
    progress: Option<Arc<IntraFileProgressListener>>,
    restart: Option<RestartTracking>,
    pool: Option<Arc<ThreadPool>>,
}

impl ParallelTransferStrategy {
    /// Send `local_file`; its length is read when the transfer starts.
    pub fn put(session: NegotiatedSession, local_file: impl Into<PathBuf>, control: Arc<TransferControlBlock>) -> Self {
        Self::new(TransferType::Put, session, local_file.into(), None, control)
    }

    /// Receive `total_length` bytes into `local_file`.
    pub fn get(
        session: NegotiatedSession,
        local_file: impl Into<PathBuf>,
        total_length: u64,
        control: Arc<TransferControlBlock>,
    ) -> Self {
        Self::new(TransferType::Get, session, local_file.into(), Some(total_length), control)
    }

    fn new(
        transfer_type: TransferType,
        session: NegotiatedSession,
        local_file: PathBuf,
        total_length: Option<u64>,
        control: Arc<TransferControlBlock>,
    ) -> Self {
        Self {
            transfer_type,
            session,
            local_file,
            irods_absolute_path: String::new(),
            total_length,
            control,
            properties: TransferProperties::default(),
            listener: None,
            progress: None,
            restart: None,
            pool: None,
        }
    }

    pub fn with_properties(mut self, properties: TransferProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Registering a listener turns faults into FAILURE events.
    pub fn with_listener(mut self, listener: Arc<dyn TransferStatusCallbackListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Overrides the intra-file listener otherwise built from the control
    /// block's transfer options.
    pub fn with_progress_listener(mut self, progress: Arc<IntraFileProgressListener>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_restart(mut self, restart: RestartTracking) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Run workers on a caller-owned pool instead of a pool built per call.
    /// The pool needs at least `number_of_threads` threads, since the server
    /// expects every connection to be open at once.
    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Remote path used in status events.
    pub fn with_irods_absolute_path(mut self, path: impl Into<String>) -> Self {
        self.irods_absolute_path = path.into();
        self
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Run the transfer. With a listener registered, a failure is reported
    /// as a FAILURE event and this returns `Ok`.
    pub fn transfer(&self) -> TransferResult<()> {
        match self.execute() {
            Ok(summary) => {
                log::info!(
                    "parallel {:?} of {} complete, {} bytes over {} workers",
                    self.transfer_type,
                    self.local_file.display(),
                    summary.bytes_transferred,
                    summary.workers
                );
                Ok(())
            }
            Err(fault) => match &self.listener {
                Some(listener) => {
                    self.notify_failure(listener.as_ref(), fault);
                    Ok(())
                }
                None => Err(fault),
            },
        }
    }

    /// Run the transfer and always return the outcome, regardless of
    /// listener registration.
    pub fn execute(&self) -> TransferResult<TransferSummary> {
        self.session.validate()?;
        self.properties
            .validate()
            .map_err(|err| TransferFault::Configuration(err.to_string()))?;
        let total_length = self.prepare_local_file()?;
        let kind = match self.transfer_type {
            TransferType::Get => WorkerKind::for_get(),
            _ => WorkerKind::for_put(&self.session, &self.properties),
        };
        let threads = self.session.number_of_threads;
        log::info!(
            "parallel {:?} of {} ({} bytes) to {} with {} threads via {:?}",
            self.transfer_type,
            self.local_file.display(),
            total_length,
            self.session.address(),
            threads,
            kind
        );

        let progress = self.progress.clone().or_else(|| self.default_progress(total_length));
        let context = Arc::new(
            WorkerContext::new(
                self.session.clone(),
                self.properties.clone(),
                self.local_file.clone(),
                Arc::clone(&self.control),
            )
            .with_restart(self.restart.clone())
            .with_progress(progress.clone()),
        );

        let ranges: Vec<Option<ByteRange>> = match kind {
            WorkerKind::GetStream => vec![None; threads],
            _ => partition_ranges(total_length, threads).into_iter().map(Some).collect(),
        };

        let outcomes = self.run_workers(kind, ranges, &context)?;
        let summary = aggregate(outcomes)?;

        if self.transfer_type == TransferType::Put && summary.bytes_transferred != total_length {
            log::warn!(
                "server requested {} bytes of a {} byte file",
                summary.bytes_transferred,
                total_length
            );
        }
        if let Some(progress) = &progress {
            progress.finish();
        }
        Ok(summary)
    }

    fn run_workers(
        &self,
        kind: WorkerKind,
        ranges: Vec<Option<ByteRange>>,
        context: &Arc<WorkerContext>,
    ) -> TransferResult<Vec<WorkerOutcome>> {
        let owned_pool;
        let pool: &ThreadPool = match &self.pool {
            Some(pool) => {
                if pool.current_num_threads() < ranges.len() {
                    log::warn!(
                        "thread pool has {} threads for {} parallel connections",
                        pool.current_num_threads(),
                        ranges.len()
                    );
                }
                pool
            }
            None => {
                owned_pool = ThreadPoolBuilder::new()
                    .num_threads(ranges.len())
                    .thread_name(|index| format!("gridflow-worker-{index}"))
                    .build()
                    .map_err(|err| TransferFault::Configuration(format!("building worker pool: {err}")))?;
                &owned_pool
            }
        };

        let outcomes = Mutex::new(Vec::with_capacity(ranges.len()));
        pool.scope(|scope| {
            for (thread_number, range) in ranges.into_iter().enumerate() {
                let context = Arc::clone(context);
                let outcomes = &outcomes;
                scope.spawn(move |_| {
                    let transfer_worker = worker::instance(kind, thread_number, range, Arc::clone(&context));
                    let outcome = worker::run(transfer_worker, &context);
                    outcomes.lock().push(outcome);
                });
            }
        });

        let mut outcomes = outcomes.into_inner();
        outcomes.sort_by_key(|outcome| outcome.thread_number);
        Ok(outcomes)
    }

    /// Returns the number of bytes the transfer covers.
    fn prepare_local_file(&self) -> TransferResult<u64> {
        match (self.transfer_type, self.total_length) {
            (TransferType::Get, Some(total_length)) => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.local_file)
                    .map_err(|err| {
                        TransferFault::transport(format!("creating {}", self.local_file.display()), err)
                    })?;
                file.set_len(total_length).map_err(|err| {
                    TransferFault::transport(format!("sizing {}", self.local_file.display()), err)
                })?;
                Ok(total_length)
            }
            _ => local_length(&self.local_file),
        }
    }

    fn default_progress(&self, total_length: u64) -> Option<Arc<IntraFileProgressListener>> {
        let listener = self.listener.as_ref()?;
        let options = self.control.transfer_options()?;
        if !options.intra_file_status_callbacks {
            return None;
        }
        Some(Arc::new(IntraFileProgressListener::new(
            self.transfer_type,
            total_length,
            Arc::clone(listener),
            options.intra_file_status_calls_interval,
            options.intra_file_status_bytes_interval,
        )))
    }

    fn notify_failure(&self, listener: &dyn TransferStatusCallbackListener, fault: TransferFault) {
        let local = self.local_file.display().to_string();
        let remote = if self.irods_absolute_path.is_empty() {
            self.session.address()
        } else {
            self.irods_absolute_path.clone()
        };
        let (source, target) = match self.transfer_type {
            TransferType::Get => (remote, local),
            _ => (local, remote),
        };
        let status = match fault {
            TransferFault::Cancelled => TransferStatus::new(
                self.transfer_type,
                source,
                target,
                "",
                self.control.total_bytes_to_transfer(),
                self.control.total_bytes_transferred_so_far(),
                self.control.file_counts(),
                TransferState::Cancelled,
            ),
            fault => TransferStatus::for_exception(
                self.transfer_type,
                source,
                target,
                "",
                self.control.total_bytes_to_transfer(),
                self.control.total_bytes_transferred_so_far(),
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
    }
}

fn local_length(path: &Path) -> TransferResult<u64> {
    std::fs::metadata(path)
        .map(|metadata| metadata.len())
        .map_err(|err| TransferFault::transport(format!("reading length of {}", path.display()), err))
}

/// The first real failure wins; cancellations only surface when nothing
/// else went wrong.
fn aggregate(outcomes: Vec<WorkerOutcome>) -> TransferResult<TransferSummary> {
    let workers = outcomes.len();
    let mut bytes_transferred = 0u64;
    let mut first_failure: Option<(usize, TransferFault)> = None;
    let mut cancelled = false;

    for outcome in outcomes {
        bytes_transferred += outcome.bytes_transferred;
        match outcome.last_error {
            Some(TransferFault::Cancelled) => cancelled = true,
            Some(fault) => {
                if first_failure.is_none() {
                    first_failure = Some((outcome.thread_number, fault));
                }
            }
            None => {}
        }
    }

    if let Some((worker, fault)) = first_failure {
        return Err(TransferFault::WorkerFailed {
            worker,
            source: Box::new(fault),
        });
    }
    if cancelled {
        return Err(TransferFault::Cancelled);
    }
    Ok(TransferSummary {
        bytes_transferred,
        workers,
    })
}

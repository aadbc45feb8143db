//! Status events and the listener contract used to report transfer progress.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::errors::{TransferFault, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Put,
    Get,
    Replicate,
    Copy,
    Synch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    InProgress,
    InProgressStartFile,
    InProgressCompleteFile,
    Success,
    Failure,
    Paused,
    Cancelled,
    Restarting,
    Skipping,
    OverallInitiation,
    OverallCompletion,
}

/// Answer to the interactive "overwrite?" question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResponse {
    YesThisFile,
    NoThisFile,
    YesForAll,
    NoForAll,
    Cancel,
}

/// Answer returned from a per-file status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStatusCallbackResponse {
    #[default]
    Continue,
    Skip,
}

/// One immutable progress or error event.
#[derive(Clone)]
pub struct TransferStatus {
    pub transfer_type: TransferType,
    pub source_absolute_path: String,
    pub target_absolute_path: String,
    pub target_resource: String,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub total_files_to_transfer: u32,
    pub total_files_transferred_so_far: u32,
    pub total_files_skipped_so_far: u32,
    pub state: TransferState,
    pub exception: Option<Arc<TransferFault>>,
    pub intra_file: bool,
}

/// File counters copied out of the control block when an event is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCounts {
    pub to_transfer: u32,
    pub transferred_so_far: u32,
    pub skipped_so_far: u32,
}

impl TransferStatus {
    pub fn new(
        transfer_type: TransferType,
        source_absolute_path: impl Into<String>,
        target_absolute_path: impl Into<String>,
        target_resource: impl Into<String>,
        total_size: u64,
        bytes_transferred: u64,
        counts: FileCounts,
        state: TransferState,
    ) -> TransferResult<Self> {
        let source_absolute_path = source_absolute_path.into();
        if source_absolute_path.is_empty() {
            return Err(TransferFault::Configuration(
                "empty source path in transfer status".into(),
            ));
        }
        Ok(Self {
            transfer_type,
            source_absolute_path,
            target_absolute_path: target_absolute_path.into(),
            target_resource: target_resource.into(),
            total_size,
            bytes_transferred,
            total_files_to_transfer: counts.to_transfer,
            total_files_transferred_so_far: counts.transferred_so_far,
            total_files_skipped_so_far: counts.skipped_so_far,
            state,
            exception: None,
            intra_file: false,
        })
    }

    pub fn for_exception(
        transfer_type: TransferType,
        source_absolute_path: impl Into<String>,
        target_absolute_path: impl Into<String>,
        target_resource: impl Into<String>,
        total_size: u64,
        bytes_transferred: u64,
        counts: FileCounts,
        fault: TransferFault,
    ) -> TransferResult<Self> {
        let mut status = Self::new(
            transfer_type,
            source_absolute_path,
            target_absolute_path,
            target_resource,
            total_size,
            bytes_transferred,
            counts,
            TransferState::Failure,
        )?;
        status.exception = Some(Arc::new(fault));
        Ok(status)
    }

    /// Progress within a single file; paths and file counters are not known
    /// at the worker level.
    pub fn intra_file(transfer_type: TransferType, total_size: u64, bytes_transferred: u64) -> Self {
        Self {
            transfer_type,
            source_absolute_path: String::new(),
            target_absolute_path: String::new(),
            target_resource: String::new(),
            total_size,
            bytes_transferred,
            total_files_to_transfer: 0,
            total_files_transferred_so_far: 0,
            total_files_skipped_so_far: 0,
            state: TransferState::InProgressStartFile,
            exception: None,
            intra_file: true,
        }
    }
}

impl fmt::Debug for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferStatus")
            .field("state", &self.state)
            .field("transfer_type", &self.transfer_type)
            .field("source", &self.source_absolute_path)
            .field("target", &self.target_absolute_path)
            .field("bytes", &format_args!("{}/{}", self.bytes_transferred, self.total_size))
            .field(
                "files",
                &format_args!(
                    "{}/{}",
                    self.total_files_transferred_so_far, self.total_files_to_transfer
                ),
            )
            .field("exception", &self.exception.as_ref().map(|e| e.to_string()))
            .field("intra_file", &self.intra_file)
            .finish()
    }
}

/// Receives progress events and answers interactive questions.
///
/// Registering a listener switches fault delivery: failures arrive as
/// FAILURE events instead of being returned from `transfer()`.
pub trait TransferStatusCallbackListener: Send + Sync {
    fn status_callback(&self, status: &TransferStatus) -> FileStatusCallbackResponse;

    fn overall_status_callback(&self, status: &TransferStatus);

    fn ask_whether_to_force_operation(&self, absolute_path: &str, is_collection: bool) -> CallbackResponse;
}

/// Folds per-buffer byte counts from all workers into periodic intra-file
/// status callbacks.
pub struct IntraFileProgressListener {
    transfer_type: TransferType,
    total_bytes: u64,
    listener: Arc<dyn TransferStatusCallbackListener>,
    calls_interval: u32,
    bytes_interval: u64,
    counters: Mutex<IntraFileCounters>,
}

#[derive(Default)]
struct IntraFileCounters {
    total_transferred: u64,
    calls_since_send: u32,
    bytes_since_send: u64,
}

impl IntraFileProgressListener {
    pub fn new(
        transfer_type: TransferType,
        total_bytes: u64,
        listener: Arc<dyn TransferStatusCallbackListener>,
        calls_interval: u32,
        bytes_interval: u64,
    ) -> Self {
        Self {
            transfer_type,
            total_bytes,
            listener,
            calls_interval,
            bytes_interval,
            counters: Mutex::new(IntraFileCounters::default()),
        }
    }

    pub fn progress(&self, bytes: u64) {
        let snapshot = {
            let mut counters = self.counters.lock();
            counters.calls_since_send += 1;
            counters.bytes_since_send += bytes;
            counters.total_transferred += bytes;
            if counters.calls_since_send > self.calls_interval
                || counters.bytes_since_send > self.bytes_interval
            {
                counters.calls_since_send = 0;
                counters.bytes_since_send = 0;
                Some(counters.total_transferred)
            } else {
                None
            }
        };

        if let Some(so_far) = snapshot {
            let status = TransferStatus::intra_file(self.transfer_type, self.total_bytes, so_far);
            self.listener.status_callback(&status);
        }
    }

    /// Report the whole file as moved.
    pub fn finish(&self) {
        let status = TransferStatus::intra_file(self.transfer_type, self.total_bytes, self.total_bytes);
        self.listener.status_callback(&status);
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.counters.lock().total_transferred
    }
}

/// Listener that forwards every event onto a channel, for UIs that consume
/// progress on another thread.
pub struct ChannelStatusListener {
    sender: Sender<TransferStatus>,
    force_answer: CallbackResponse,
}

impl ChannelStatusListener {
    pub fn new(sender: Sender<TransferStatus>, force_answer: CallbackResponse) -> Self {
        Self {
            sender,
            force_answer,
        }
    }
}

impl TransferStatusCallbackListener for ChannelStatusListener {
    fn status_callback(&self, status: &TransferStatus) -> FileStatusCallbackResponse {
        // A dropped receiver just means nobody is watching any more.
        let _ = self.sender.send(status.clone());
        FileStatusCallbackResponse::Continue
    }

    fn overall_status_callback(&self, status: &TransferStatus) {
        let _ = self.sender.send(status.clone());
    }

    fn ask_whether_to_force_operation(&self, _absolute_path: &str, _is_collection: bool) -> CallbackResponse {
        self.force_answer
    }
}

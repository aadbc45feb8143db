//! Shared coordination state for one logical transfer.
//!
//! The control block is created by the caller, handed to the strategy and
//! every worker behind an `Arc`, and polled between protocol frames. All
//! state lives behind a single mutex so compound operations such as
//! "record an error and decide whether to give up" happen in one critical
//! section.

use parking_lot::Mutex;

use crate::errors::{TransferFault, TransferResult};
use crate::status::FileCounts;

/// Errors tolerated before a transfer is abandoned, unless overridden.
pub const MAX_ERROR_DEFAULT: i32 = 5;

/// How to treat an existing target during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceOption {
    UseForce,
    NoForce,
    #[default]
    AskCallbackListener,
}

/// Per-transfer options carried on the control block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub intra_file_status_callbacks: bool,
    pub intra_file_status_calls_interval: u32,
    pub intra_file_status_bytes_interval: u64,
    /// Let siblings stop before their next frame once one worker fails.
    pub abandon_siblings_on_failure: bool,
    pub force_option: ForceOption,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            intra_file_status_callbacks: false,
            intra_file_status_calls_interval: 5,
            intra_file_status_bytes_interval: 4 * 1024 * 1024,
            abandon_siblings_on_failure: false,
            force_option: ForceOption::default(),
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    restart_absolute_path: String,
    restart_hit: bool,
    cancelled: bool,
    paused: bool,
    max_errors_before_canceling: i32,
    error_count: i32,
    total_files_to_transfer: u32,
    total_files_transferred_so_far: u32,
    total_files_skipped_so_far: u32,
    total_bytes_to_transfer: u64,
    total_bytes_transferred_so_far: u64,
    transfer_options: Option<TransferOptions>,
}

impl ControlState {
    fn threshold_reached(&self) -> bool {
        self.max_errors_before_canceling > 0
            && self.error_count >= self.max_errors_before_canceling
    }
}

#[derive(Debug)]
pub struct TransferControlBlock {
    state: Mutex<ControlState>,
}

impl Default for TransferControlBlock {
    fn default() -> Self {
        Self {
            state: Mutex::new(ControlState {
                max_errors_before_canceling: MAX_ERROR_DEFAULT,
                ..ControlState::default()
            }),
        }
    }
}

impl TransferControlBlock {
    /// `max_errors_before_canceling` must be >= -1; -1 means unlimited.
    pub fn new(
        restart_absolute_path: Option<&str>,
        max_errors_before_canceling: i32,
    ) -> TransferResult<Self> {
        check_max_errors(max_errors_before_canceling)?;
        let block = Self::default();
        {
            let mut state = block.state.lock();
            state.max_errors_before_canceling = max_errors_before_canceling;
            state.restart_absolute_path = restart_absolute_path.unwrap_or_default().to_string();
        }
        Ok(block)
    }

    /// Reset progress and restart tracking so the block can drive another,
    /// independent transfer. Cancel/pause flags and options are kept.
    pub fn reset_transfer_data(&self) {
        let mut state = self.state.lock();
        state.restart_hit = false;
        state.restart_absolute_path.clear();
        state.error_count = 0;
        state.total_files_to_transfer = 0;
        state.total_files_transferred_so_far = 0;
        state.total_files_skipped_so_far = 0;
        state.total_bytes_to_transfer = 0;
        state.total_bytes_transferred_so_far = 0;
    }

    /// Skip everything up to and including the restart path, then accept the
    /// rest. With no restart path configured every path is accepted.
    pub fn filter(&self, absolute_path: &str) -> bool {
        let mut state = self.state.lock();
        if state.restart_absolute_path.is_empty() {
            return true;
        }
        if state.restart_hit {
            return true;
        }
        if absolute_path == state.restart_absolute_path {
            log::info!("hit the restart path {absolute_path}");
            state.restart_hit = true;
            return false;
        }
        false
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn set_cancelled(&self, cancelled: bool) {
        self.state.lock().cancelled = cancelled;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn max_errors_before_canceling(&self) -> i32 {
        self.state.lock().max_errors_before_canceling
    }

    pub fn set_max_errors_before_canceling(&self, max: i32) -> TransferResult<()> {
        check_max_errors(max)?;
        self.state.lock().max_errors_before_canceling = max;
        Ok(())
    }

    pub fn error_count(&self) -> i32 {
        self.state.lock().error_count
    }

    /// Returns the error count after this report.
    pub fn report_error_in_transfer(&self) -> i32 {
        let mut state = self.state.lock();
        state.error_count += 1;
        state.error_count
    }

    pub fn should_transfer_be_abandoned_due_to_number_of_errors(&self) -> bool {
        self.state.lock().threshold_reached()
    }

    /// Record an error and, if the threshold is now reached, flip the block
    /// to cancelled. Returns whether the transfer should be abandoned.
    pub fn report_error_and_check_threshold(&self) -> bool {
        let mut state = self.state.lock();
        state.error_count += 1;
        let abandon = state.threshold_reached();
        if abandon && !state.cancelled {
            log::warn!(
                "cancelling transfer after {} errors (limit {})",
                state.error_count,
                state.max_errors_before_canceling
            );
            state.cancelled = true;
        }
        abandon
    }

    pub fn total_files_to_transfer(&self) -> u32 {
        self.state.lock().total_files_to_transfer
    }

    pub fn set_total_files_to_transfer(&self, total: u32) {
        self.state.lock().total_files_to_transfer = total;
    }

    pub fn total_files_transferred_so_far(&self) -> u32 {
        self.state.lock().total_files_transferred_so_far
    }

    pub fn increment_files_transferred_so_far(&self) -> u32 {
        let mut state = self.state.lock();
        state.total_files_transferred_so_far += 1;
        state.total_files_transferred_so_far
    }

    pub fn total_files_skipped_so_far(&self) -> u32 {
        self.state.lock().total_files_skipped_so_far
    }

    /// A skipped file still counts towards files processed.
    pub fn increment_files_skipped_so_far(&self) -> u32 {
        let mut state = self.state.lock();
        state.total_files_transferred_so_far += 1;
        state.total_files_skipped_so_far += 1;
        state.total_files_skipped_so_far
    }

    pub fn actual_files_transferred_without_skipped(&self) -> u32 {
        let state = self.state.lock();
        state
            .total_files_transferred_so_far
            .saturating_sub(state.total_files_skipped_so_far)
    }

    /// Consistent snapshot of the file counters for a status event.
    pub fn file_counts(&self) -> FileCounts {
        let state = self.state.lock();
        FileCounts {
            to_transfer: state.total_files_to_transfer,
            transferred_so_far: state.total_files_transferred_so_far,
            skipped_so_far: state.total_files_skipped_so_far,
        }
    }

    pub fn total_bytes_to_transfer(&self) -> u64 {
        self.state.lock().total_bytes_to_transfer
    }

    pub fn set_total_bytes_to_transfer(&self, total: u64) {
        self.state.lock().total_bytes_to_transfer = total;
    }

    pub fn total_bytes_transferred_so_far(&self) -> u64 {
        self.state.lock().total_bytes_transferred_so_far
    }

    pub fn increment_total_bytes_transferred_so_far(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.total_bytes_transferred_so_far =
            state.total_bytes_transferred_so_far.saturating_add(bytes);
    }

    pub fn restart_absolute_path(&self) -> String {
        self.state.lock().restart_absolute_path.clone()
    }

    pub fn set_restart_absolute_path(&self, path: &str) {
        let mut state = self.state.lock();
        state.restart_absolute_path = path.to_string();
        state.restart_hit = false;
    }

    pub fn transfer_options(&self) -> Option<TransferOptions> {
        self.state.lock().transfer_options.clone()
    }

    pub fn set_transfer_options(&self, options: Option<TransferOptions>) {
        self.state.lock().transfer_options = options;
    }
}

fn check_max_errors(max: i32) -> TransferResult<()> {
    if max < -1 {
        return Err(TransferFault::Configuration(
            "max errors before canceling must be >= -1".into(),
        ));
    }
    Ok(())
}

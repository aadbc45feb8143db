//! Fault taxonomy for parallel transfers.
//!
//! Faults are categorized so callers can decide whether to retry the whole
//! operation:
//! - Retryable: transient socket conditions (timeouts, resets)
//! - Fatal: protocol violations, byte-accounting mismatches, missing files
//! - NoRetry: not an error condition, but the operation should not be retried

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Category of transfer fault for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retrying the whole operation may succeed.
    Retryable,
    /// Permanent error - retrying would desynchronize offsets or hit the same wall.
    Fatal,
    /// Not an error, but should not retry (e.g. cancelled by the user).
    NoRetry,
}

/// Faults raised by workers, strategies, and the restart processor.
#[derive(Debug, Error)]
pub enum TransferFault {
    /// Socket or local file I/O failed.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The peer sent something the framing rules do not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bytes moved for a frame did not match the bytes requested.
    #[error("byte count mismatch: expected {expected}, moved {actual}")]
    ByteCountMismatch { expected: u64, actual: u64 },

    /// A read returned nothing while the frame still expected data.
    #[error("parallel transfer stalled with {remaining} bytes outstanding")]
    Stalled { remaining: u64 },

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transfer cancelled")]
    Cancelled,

    /// The target exists and overwriting it was not confirmed.
    #[error("target {0} already exists")]
    TargetExists(String),

    /// Aggregated fault surfaced by the strategy after all workers joined.
    #[error("parallel worker {worker} failed: {source}")]
    WorkerFailed {
        worker: usize,
        #[source]
        source: Box<TransferFault>,
    },

    #[error(transparent)]
    Restart(#[from] RestartFault),
}

impl TransferFault {
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferFault::Transport { source, .. } => categorize_io_error(source),
            TransferFault::Cancelled => ErrorCategory::NoRetry,
            TransferFault::WorkerFailed { source, .. } => source.category(),
            TransferFault::Restart(fault) => fault.category(),
            TransferFault::Protocol(_)
            | TransferFault::ByteCountMismatch { .. }
            | TransferFault::Stalled { .. }
            | TransferFault::Cipher(_)
            | TransferFault::Configuration(_)
            | TransferFault::TargetExists(_) => ErrorCategory::Fatal,
        }
    }

    /// Unwraps the strategy's aggregation layer, if any.
    pub fn root(&self) -> &TransferFault {
        match self {
            TransferFault::WorkerFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Faults raised while tracking or replaying restart checkpoints.
#[derive(Debug, Error)]
pub enum RestartFault {
    #[error("restart manager not configured")]
    NotConfigured,

    #[error("unable to find restart info")]
    NotFound,

    #[error("local file not found: {}", .0.display())]
    LocalFileMissing(PathBuf),

    #[error("no restart segment for thread {thread}")]
    MissingSegment { thread: usize },

    #[error("restart segment thread mismatch: requested {requested}, found {found}")]
    ThreadMismatch { requested: usize, found: usize },

    #[error("restart attempted {attempts} times, limit is {max}")]
    TooManyAttempts { attempts: u32, max: u32 },

    #[error("{context}: {source}")]
    Replay {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("restart balance error: {0}")]
    Balance(String),

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("restart record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl RestartFault {
    pub fn replay(context: impl Into<String>, source: io::Error) -> Self {
        Self::Replay {
            context: context.into(),
            source,
        }
    }

    pub fn store(context: impl Into<String>, source: io::Error) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RestartFault::Replay { source, .. } | RestartFault::Store { source, .. } => {
                categorize_io_error(source)
            }
            _ => ErrorCategory::Fatal,
        }
    }
}

/// Categorize an IO error for retry decisions.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        // Retryable: transient conditions
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,

        // Fatal: permanent conditions
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::AlreadyExists => ErrorCategory::Fatal,

        // A short read mid-frame means offsets are no longer trustworthy.
        io::ErrorKind::WriteZero
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionRefused => ErrorCategory::Fatal,

        _ => ErrorCategory::Fatal,
    }
}

/// Result type for transfer operations.
pub type TransferResult<T> = std::result::Result<T, TransferFault>;

/// Result type for restart bookkeeping.
pub type RestartResult<T> = std::result::Result<T, RestartFault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_timeout_is_retryable() {
        let err = TransferFault::transport(
            "reading frame header",
            io::Error::new(io::ErrorKind::TimedOut, "timeout"),
        );
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn protocol_faults_are_fatal() {
        assert_eq!(
            TransferFault::protocol("unknown operation 7").category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            TransferFault::Stalled { remaining: 10 }.category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            TransferFault::ByteCountMismatch {
                expected: 5,
                actual: 4
            }
            .category(),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn cancelled_is_no_retry() {
        assert_eq!(TransferFault::Cancelled.category(), ErrorCategory::NoRetry);
    }

    #[test]
    fn worker_failure_reports_root_cause() {
        let err = TransferFault::WorkerFailed {
            worker: 3,
            source: Box::new(TransferFault::Stalled { remaining: 42 }),
        };
        assert!(matches!(err.root(), TransferFault::Stalled { remaining: 42 }));
        assert!(err.to_string().contains("worker 3"));
    }

    #[test]
    fn test_io_error_categorization() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(categorize_io_error(&timeout), ErrorCategory::Retryable);

        let perm = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(categorize_io_error(&perm), ErrorCategory::Fatal);
    }
}

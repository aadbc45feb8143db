pub mod config;
pub mod control;
pub mod crypto;
pub mod errors;
pub mod operations;
pub mod protocol;
pub mod restart;
pub mod session;
pub mod status;
pub mod strategy;
pub mod worker;
pub mod zero_copy;

pub use control::{ForceOption, TransferControlBlock, TransferOptions};
pub use errors::{ErrorCategory, RestartFault, TransferFault, TransferResult};
pub use operations::ParallelFileTransfer;
pub use session::NegotiatedSession;
pub use strategy::{ParallelTransferStrategy, TransferSummary};

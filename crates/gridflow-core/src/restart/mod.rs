//! Checkpoints for long transfers and the processor that resumes them.

pub mod info;
pub mod manager;
pub mod processor;
pub mod store;

pub use info::{
    FileRestartDataSegment, FileRestartInfo, FileRestartInfoIdentifier, RestartStatus, RestartType,
    RESTART_FILE_UPDATE_SIZE,
};
pub use manager::{MemoryRestartManager, RestartManager};
pub use processor::{OpenMode, RandomAccessFile, RemoteFileAccess, RestartProcessor};
pub use store::FileRestartManager;

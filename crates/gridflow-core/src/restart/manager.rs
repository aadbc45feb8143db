use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;

use super::info::{FileRestartDataSegment, FileRestartInfo, FileRestartInfoIdentifier};
use crate::errors::{RestartFault, RestartResult};

/// Persistence boundary for restart checkpoints.
///
/// Implementations must make `retrieve_or_insert` and `update_restart`
/// atomic per key; the provided segment helpers build on those two.
pub trait RestartManager: Send + Sync {
    fn retrieve_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<Option<FileRestartInfo>>;

    fn store_restart(&self, info: &FileRestartInfo) -> RestartResult<FileRestartInfoIdentifier>;

    /// Deleting an absent key is not an error.
    fn delete_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<()>;

    /// Store `info` unless a record already exists; return whichever is stored.
    fn retrieve_or_insert(&self, info: FileRestartInfo) -> RestartResult<FileRestartInfo>;

    /// Apply `update` to the stored record and persist the result.
    fn update_restart(
        &self,
        id: &FileRestartInfoIdentifier,
        update: &mut dyn FnMut(&mut FileRestartInfo) -> RestartResult<()>,
    ) -> RestartResult<FileRestartInfo>;

    fn retrieve_or_create(
        &self,
        id: &FileRestartInfoIdentifier,
        local_absolute_path: &Path,
        file_size: u64,
        number_of_threads: usize,
    ) -> RestartResult<FileRestartInfo> {
        self.retrieve_or_insert(FileRestartInfo::new(
            id,
            local_absolute_path,
            file_size,
            number_of_threads,
        ))
    }

    /// A worker started a new range: move its segment and clear the length.
    fn update_offset_for_segment(
        &self,
        id: &FileRestartInfoIdentifier,
        thread_number: usize,
        offset: u64,
    ) -> RestartResult<()> {
        self.update_restart(id, &mut |info| {
            let segment = segment_for_thread(info, thread_number)?;
            segment.offset = offset;
            segment.length = 0;
            Ok(())
        })?;
        Ok(())
    }

    fn update_length_for_segment(
        &self,
        id: &FileRestartInfoIdentifier,
        thread_number: usize,
        length_delta: u64,
    ) -> RestartResult<()> {
        self.update_restart(id, &mut |info| {
            let segment = segment_for_thread(info, thread_number)?;
            segment.length += length_delta;
            Ok(())
        })?;
        Ok(())
    }

    /// Append an empty segment at `offset`, returning its index.
    fn add_segment(&self, id: &FileRestartInfoIdentifier, offset: u64) -> RestartResult<usize> {
        let mut index = 0;
        self.update_restart(id, &mut |info| {
            index = info.segments.len();
            info.segments.push(FileRestartDataSegment {
                thread_number: index,
                offset,
                length: 0,
            });
            Ok(())
        })?;
        Ok(index)
    }

    /// Bump the attempt counter; fails once it passes `max_attempts`.
    fn increment_restart_attempts(
        &self,
        id: &FileRestartInfoIdentifier,
        max_attempts: u32,
    ) -> RestartResult<FileRestartInfo> {
        let info = self.update_restart(id, &mut |info| {
            info.restart_attempts += 1;
            Ok(())
        })?;
        if info.restart_attempts > max_attempts {
            log::error!(
                "too many restart attempts for {}: {} > {}",
                id,
                info.restart_attempts,
                max_attempts
            );
            return Err(RestartFault::TooManyAttempts {
                attempts: info.restart_attempts,
                max: max_attempts,
            });
        }
        Ok(info)
    }
}

fn segment_for_thread(
    info: &mut FileRestartInfo,
    thread_number: usize,
) -> RestartResult<&mut FileRestartDataSegment> {
    let segment = info
        .segments
        .get_mut(thread_number)
        .ok_or(RestartFault::MissingSegment { thread: thread_number })?;
    if segment.thread_number != thread_number {
        log::error!("segment thread number does not match requested {thread_number}: {segment:?}");
        return Err(RestartFault::ThreadMismatch {
            requested: thread_number,
            found: segment.thread_number,
        });
    }
    Ok(segment)
}

/// Checkpoints held in process memory.
#[derive(Default)]
pub struct MemoryRestartManager {
    records: Mutex<HashMap<FileRestartInfoIdentifier, FileRestartInfo>>,
}

impl MemoryRestartManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RestartManager for MemoryRestartManager {
    fn retrieve_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<Option<FileRestartInfo>> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn store_restart(&self, info: &FileRestartInfo) -> RestartResult<FileRestartInfoIdentifier> {
        let id = info.identifier();
        self.records.lock().insert(id.clone(), info.clone());
        Ok(id)
    }

    fn delete_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    fn retrieve_or_insert(&self, info: FileRestartInfo) -> RestartResult<FileRestartInfo> {
        let mut records = self.records.lock();
        let stored = records.entry(info.identifier()).or_insert_with(|| {
            log::info!("no restart saved for {}, storing a new one", info.identifier());
            info
        });
        Ok(stored.clone())
    }

    fn update_restart(
        &self,
        id: &FileRestartInfoIdentifier,
        update: &mut dyn FnMut(&mut FileRestartInfo) -> RestartResult<()>,
    ) -> RestartResult<FileRestartInfo> {
        let mut records = self.records.lock();
        let info = records.get_mut(id).ok_or(RestartFault::NotFound)?;
        update(info)?;
        Ok(info.clone())
    }
}

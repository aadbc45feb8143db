use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use gridflow_core::config::TransferProperties;
use gridflow_core::errors::RestartResult;
use gridflow_core::restart::{
    FileRestartInfo, FileRestartInfoIdentifier, FileRestartManager, MemoryRestartManager, OpenMode,
    RandomAccessFile, RemoteFileAccess, RestartManager, RestartProcessor, RestartType, RESTART_FILE_UPDATE_SIZE,
};
use gridflow_core::TransferControlBlock;
use parking_lot::Mutex;
use tempfile::tempdir;

#[test]
fn file_store_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let id = FileRestartInfoIdentifier::new("rods#zone", "/zone/home/rods/big.dat", RestartType::Get);
    {
        let store = FileRestartManager::new(dir.path())?;
        store.retrieve_or_create(&id, Path::new("/tmp/big.dat"), 1 << 30, 4)?;
        store.update_offset_for_segment(&id, 2, 512 << 20)?;
        store.update_length_for_segment(&id, 2, RESTART_FILE_UPDATE_SIZE)?;
        store.increment_restart_attempts(&id, 5)?;
    }

    let store = FileRestartManager::new(dir.path())?;
    let info = store
        .retrieve_restart(&id)?
        .ok_or_else(|| eyre::eyre!("record lost on reopen"))?;
    assert_eq!(info.file_size, 1 << 30);
    assert_eq!(info.restart_attempts, 1);
    assert_eq!(info.segments.len(), 4);
    assert_eq!(info.segments[2].offset, 512 << 20);
    assert_eq!(info.segments[2].length, RESTART_FILE_UPDATE_SIZE);
    assert_eq!(info.identifier(), id);

    assert_eq!(store.list()?.len(), 1);
    assert_eq!(store.clear()?, 1);
    assert!(store.retrieve_restart(&id)?.is_none());
    Ok(())
}

#[test]
fn directions_are_stored_separately() -> Result<()> {
    let dir = tempdir()?;
    let store = FileRestartManager::new(dir.path())?;
    let get = FileRestartInfoIdentifier::new("rods#zone", "/zone/a", RestartType::Get);
    let put = FileRestartInfoIdentifier::new("rods#zone", "/zone/a", RestartType::Put);
    store.retrieve_or_create(&get, Path::new("/tmp/a"), 10, 1)?;
    store.retrieve_or_create(&put, Path::new("/tmp/a"), 20, 1)?;

    store.delete_restart(&get)?;
    store.delete_restart(&get)?;
    assert!(store.retrieve_restart(&get)?.is_none());
    assert_eq!(store.retrieve_restart(&put)?.map(|info| info.file_size), Some(20));
    Ok(())
}

/// Remembers every segment length written, to observe intermediate checkpoints.
#[derive(Default)]
struct RecordingManager {
    inner: MemoryRestartManager,
    snapshots: Mutex<Vec<Vec<u64>>>,
}

impl RestartManager for RecordingManager {
    fn retrieve_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<Option<FileRestartInfo>> {
        self.inner.retrieve_restart(id)
    }

    fn store_restart(&self, info: &FileRestartInfo) -> RestartResult<FileRestartInfoIdentifier> {
        self.inner.store_restart(info)
    }

    fn delete_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<()> {
        self.inner.delete_restart(id)
    }

    fn retrieve_or_insert(&self, info: FileRestartInfo) -> RestartResult<FileRestartInfo> {
        self.inner.retrieve_or_insert(info)
    }

    fn update_restart(
        &self,
        id: &FileRestartInfoIdentifier,
        update: &mut dyn FnMut(&mut FileRestartInfo) -> RestartResult<()>,
    ) -> RestartResult<FileRestartInfo> {
        let info = self.inner.update_restart(id, update)?;
        self.snapshots
            .lock()
            .push(info.segments.iter().map(|segment| segment.length).collect());
        Ok(info)
    }
}

/// Grid side stored flat in a local directory.
struct DirRemote(PathBuf);

impl RemoteFileAccess for DirRemote {
    fn open(&self, absolute_path: &str, mode: OpenMode) -> io::Result<Box<dyn RandomAccessFile>> {
        let path = self.0.join(absolute_path.trim_start_matches('/').replace('/', "_"));
        let file = match mode {
            OpenMode::Read => File::open(path)?,
            OpenMode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        Ok(Box::new(file))
    }
}

#[test]
fn put_replay_checkpoints_long_gaps() -> Result<()> {
    const CONFIRMED: u64 = 1 << 20;
    let total = RESTART_FILE_UPDATE_SIZE + CONFIRMED + 100;
    let content: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();

    let local_dir = tempdir()?;
    let remote_dir = tempdir()?;
    let local = local_dir.path().join("big.dat");
    fs::write(&local, &content)?;
    fs::write(remote_dir.path().join("zone_big.dat"), &content[..CONFIRMED as usize])?;

    let manager = Arc::new(RecordingManager::default());
    let id = FileRestartInfoIdentifier::new("rods#zone", "/zone/big.dat", RestartType::Put);
    manager.retrieve_or_create(&id, &local, total, 1)?;
    manager.update_length_for_segment(&id, 0, CONFIRMED)?;
    manager.snapshots.lock().clear();

    let processor = RestartProcessor::put(
        "rods#zone",
        Some(manager.clone()),
        Arc::new(DirRemote(remote_dir.path().to_path_buf())),
        Arc::new(TransferControlBlock::default()),
        TransferProperties::default(),
    );
    processor.restart_if_necessary("/zone/big.dat")?;

    assert_eq!(fs::read(remote_dir.path().join("zone_big.dat"))?, content);
    assert!(manager.retrieve_restart(&id)?.is_none());

    let snapshots = manager.snapshots.lock();
    assert!(
        snapshots.contains(&vec![CONFIRMED, RESTART_FILE_UPDATE_SIZE]),
        "no intermediate checkpoint in {snapshots:?}"
    );
    assert_eq!(snapshots.last(), Some(&vec![CONFIRMED, RESTART_FILE_UPDATE_SIZE + 100]));
    Ok(())
}

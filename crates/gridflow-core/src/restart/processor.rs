//! Resume an interrupted transfer by replaying only the byte ranges no
//! checkpoint segment confirms.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use super::info::{FileRestartInfo, FileRestartInfoIdentifier, RestartType, RESTART_FILE_UPDATE_SIZE};
use super::manager::RestartManager;
use crate::config::TransferProperties;
use crate::control::TransferControlBlock;
use crate::errors::{RestartFault, TransferFault, TransferResult};
use crate::status::{
    IntraFileProgressListener, TransferState, TransferStatus, TransferStatusCallbackListener, TransferType,
};

/// A seekable handle on one file, local or remote.
pub trait RandomAccessFile: Read + Write + Seek + Send {
    fn length(&mut self) -> io::Result<u64>;
}

impl RandomAccessFile for File {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Random access to files on the grid side of the transfer.
pub trait RemoteFileAccess: Send + Sync {
    fn open(&self, absolute_path: &str, mode: OpenMode) -> io::Result<Box<dyn RandomAccessFile>>;
}

pub struct RestartProcessor {
    restart_type: RestartType,
    account_identifier: String,
    restart_manager: Option<Arc<dyn RestartManager>>,
    remote: Arc<dyn RemoteFileAccess>,
    control: Arc<TransferControlBlock>,
    listener: Option<Arc<dyn TransferStatusCallbackListener>>,
    properties: TransferProperties,
}

impl RestartProcessor {
    /// Replays remote ranges into the local file.
    pub fn get(
        account_identifier: impl Into<String>,
        restart_manager: Option<Arc<dyn RestartManager>>,
        remote: Arc<dyn RemoteFileAccess>,
        control: Arc<TransferControlBlock>,
        properties: TransferProperties,
    ) -> Self {
        Self::new(RestartType::Get, account_identifier, restart_manager, remote, control, properties)
    }

    /// Replays local ranges into the remote file.
    pub fn put(
        account_identifier: impl Into<String>,
        restart_manager: Option<Arc<dyn RestartManager>>,
        remote: Arc<dyn RemoteFileAccess>,
        control: Arc<TransferControlBlock>,
        properties: TransferProperties,
    ) -> Self {
        Self::new(RestartType::Put, account_identifier, restart_manager, remote, control, properties)
    }

    fn new(
        restart_type: RestartType,
        account_identifier: impl Into<String>,
        restart_manager: Option<Arc<dyn RestartManager>>,
        remote: Arc<dyn RemoteFileAccess>,
        control: Arc<TransferControlBlock>,
        properties: TransferProperties,
    ) -> Self {
        Self {
            restart_type,
            account_identifier: account_identifier.into(),
            restart_manager,
            remote,
            control,
            listener: None,
            properties,
        }
    }

    /// Faults are delivered to the listener instead of being returned.
    pub fn with_listener(mut self, listener: Arc<dyn TransferStatusCallbackListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn restart_type(&self) -> RestartType {
        self.restart_type
    }

    /// Resume the transfer for `irods_absolute_path` if a checkpoint exists.
    /// No checkpoint is not an error.
    pub fn restart_if_necessary(&self, irods_absolute_path: &str) -> TransferResult<()> {
        if irods_absolute_path.is_empty() {
            return Err(TransferFault::Configuration("empty irods absolute path".into()));
        }
        let manager = self.restart_manager.as_ref().ok_or_else(|| {
            log::error!("no restart manager configured");
            RestartFault::NotConfigured
        })?;

        let id = FileRestartInfoIdentifier::new(
            self.account_identifier.clone(),
            irods_absolute_path,
            self.restart_type,
        );
        log::info!("checking for restart of {id}");
        let Some(info) = manager.retrieve_restart(&id)? else {
            log::info!("no restart recorded for {id}");
            return Ok(());
        };

        let outcome = manager
            .increment_restart_attempts(&id, self.properties.max_restart_attempts)
            .map_err(TransferFault::from)
            .and_then(|info| {
                log::info!("restarting {id}, attempt {}", info.restart_attempts);
                self.notify(&info, TransferState::Restarting, 0, None);
                self.replay(manager.as_ref(), &info)
            });

        match outcome {
            Ok(replayed) => {
                log::info!("restart of {id} completed after {replayed} bytes, removing checkpoint");
                manager.delete_restart(&id)?;
                self.notify(&info, TransferState::Success, replayed, None);
                Ok(())
            }
            Err(fault) => {
                log::error!("restart of {id} failed: {fault}");
                if self.listener.is_none() {
                    return Err(fault);
                }
                let state = match fault {
                    TransferFault::Cancelled => TransferState::Cancelled,
                    _ => TransferState::Failure,
                };
                self.notify(&info, state, self.control.total_bytes_transferred_so_far(), Some(fault));
                Ok(())
            }
        }
    }

    fn replay(&self, manager: &dyn RestartManager, info: &FileRestartInfo) -> TransferResult<u64> {
        let local_path = &info.local_absolute_path;
        if local_path.as_os_str().is_empty() || !local_path.exists() {
            log::error!("local file not found: {}", local_path.display());
            return Err(RestartFault::LocalFileMissing(local_path.clone()).into());
        }

        let (source, dest): (Box<dyn RandomAccessFile>, Box<dyn RandomAccessFile>) = match self.restart_type {
            RestartType::Get => {
                let remote = self
                    .remote
                    .open(&info.irods_absolute_path, OpenMode::Read)
                    .map_err(|err| RestartFault::replay("opening remote file for read", err))?;
                let local = OpenOptions::new()
                    .write(true)
                    .open(local_path)
                    .map_err(|err| RestartFault::replay(format!("opening {}", local_path.display()), err))?;
                (remote, Box::new(local))
            }
            RestartType::Put => {
                let local = File::open(local_path)
                    .map_err(|err| RestartFault::replay(format!("opening {}", local_path.display()), err))?;
                let remote = self
                    .remote
                    .open(&info.irods_absolute_path, OpenMode::Write)
                    .map_err(|err| RestartFault::replay("opening remote file for write", err))?;
                (Box::new(local), remote)
            }
        };

        let mut gaps = GapReplay {
            manager,
            id: info.identifier(),
            control: &self.control,
            progress: self.intra_file_listener(info.file_size),
            buffer: vec![0u8; self.properties.put_buffer_size],
            source,
            dest,
            replayed: 0,
        };
        let source_length = gaps
            .source
            .length()
            .map_err(|err| RestartFault::replay("reading source length", err))?;

        let mut current = 0u64;
        for segment in info.segments_by_offset() {
            if self.control.is_cancelled() {
                return Err(TransferFault::Cancelled);
            }
            log::debug!("process segment {segment:?} at {current}");
            if segment.offset < current {
                log::warn!("segment {segment:?} starts before {current}, skipping its gap");
                current = current.max(segment.end());
                continue;
            }
            if segment.offset > current {
                gaps.copy_gap(current, segment.offset - current)?;
            }
            current = segment.end();
        }

        if source_length > current {
            log::info!("writing last segment based on file length");
            gaps.copy_gap(current, source_length - current)?;
        }

        if let Some(progress) = &gaps.progress {
            progress.finish();
        }
        Ok(gaps.replayed)
    }

    fn intra_file_listener(&self, total: u64) -> Option<IntraFileProgressListener> {
        let listener = self.listener.as_ref()?;
        let options = self.control.transfer_options()?;
        if !options.intra_file_status_callbacks {
            return None;
        }
        Some(IntraFileProgressListener::new(
            self.transfer_type(),
            total,
            Arc::clone(listener),
            options.intra_file_status_calls_interval,
            options.intra_file_status_bytes_interval,
        ))
    }

    fn transfer_type(&self) -> TransferType {
        match self.restart_type {
            RestartType::Get => TransferType::Get,
            RestartType::Put => TransferType::Put,
        }
    }

    fn notify(&self, info: &FileRestartInfo, state: TransferState, bytes: u64, fault: Option<TransferFault>) {
        let Some(listener) = &self.listener else {
            return;
        };
        let local = info.local_absolute_path.display().to_string();
        let (source, target) = match self.restart_type {
            RestartType::Get => (info.irods_absolute_path.clone(), local),
            RestartType::Put => (local, info.irods_absolute_path.clone()),
        };
        let counts = self.control.file_counts();
        let status = match fault {
            Some(fault) if state == TransferState::Failure => TransferStatus::for_exception(
                self.transfer_type(),
                source,
                target,
                "",
                info.file_size,
                bytes,
                counts,
                fault,
            ),
            _ => TransferStatus::new(
                self.transfer_type(),
                source,
                target,
                "",
                info.file_size,
                bytes,
                counts,
                state,
            ),
        };
        match status {
            Ok(status) => {
                listener.status_callback(&status);
            }
            Err(err) => log::warn!("unable to build restart status: {err}"),
        }
    }
}

struct GapReplay<'a> {
    manager: &'a dyn RestartManager,
    id: FileRestartInfoIdentifier,
    control: &'a TransferControlBlock,
    progress: Option<IntraFileProgressListener>,
    buffer: Vec<u8>,
    source: Box<dyn RandomAccessFile>,
    dest: Box<dyn RandomAccessFile>,
    replayed: u64,
}

impl GapReplay<'_> {
    /// Copy `[start, start + gap)` from source to destination, recording it
    /// as a new segment that grows every `RESTART_FILE_UPDATE_SIZE` bytes.
    fn copy_gap(&mut self, start: u64, gap: u64) -> TransferResult<()> {
        log::info!("replaying gap of {gap} bytes at {start}");
        self.source
            .seek(SeekFrom::Start(start))
            .map_err(|err| RestartFault::replay("seeking source", err))?;
        self.dest
            .seek(SeekFrom::Start(start))
            .map_err(|err| RestartFault::replay("seeking destination", err))?;
        let index = self.manager.add_segment(&self.id, start)?;

        let mut remaining = gap;
        let mut total_written = 0u64;
        let mut written_since_update = 0u64;
        while remaining > 0 {
            if self.control.is_cancelled() {
                self.checkpoint(index, written_since_update)?;
                return Err(TransferFault::Cancelled);
            }

            let want = remaining.min(self.buffer.len() as u64) as usize;
            let read = self
                .source
                .read(&mut self.buffer[..want])
                .map_err(|err| RestartFault::replay("reading source", err))?;
            if read == 0 {
                log::error!("read 0 bytes with {remaining} bytes of gap left");
                return Err(RestartFault::replay(
                    "reading source",
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source ended with {remaining} bytes of gap left"),
                    ),
                )
                .into());
            }
            self.dest
                .write_all(&self.buffer[..read])
                .map_err(|err| RestartFault::replay("writing destination", err))?;

            let read = read as u64;
            remaining -= read;
            total_written += read;
            written_since_update += read;
            self.replayed += read;
            self.control.increment_total_bytes_transferred_so_far(read);
            if let Some(progress) = &self.progress {
                progress.progress(read);
            }

            if written_since_update >= RESTART_FILE_UPDATE_SIZE {
                self.checkpoint(index, written_since_update)?;
                written_since_update = 0;
            }
        }
        self.checkpoint(index, written_since_update)?;

        if remaining != 0 || total_written != gap {
            log::error!("gap replay out of balance: gap {gap}, written {total_written}, left {remaining}");
            return Err(RestartFault::Balance(format!(
                "gap of {gap} bytes at {start} replayed {total_written} bytes"
            ))
            .into());
        }
        Ok(())
    }

    fn checkpoint(&mut self, index: usize, written: u64) -> TransferResult<()> {
        if written == 0 {
            return Ok(());
        }
        self.dest
            .flush()
            .map_err(|err| RestartFault::replay("flushing destination", err))?;
        self.manager.update_length_for_segment(&self.id, index, written)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TransferOptions;
    use crate::restart::manager::MemoryRestartManager;
    use crate::status::ChannelStatusListener;
    use crate::status::CallbackResponse;
    use crossbeam_channel::unbounded;
    use std::path::{Path, PathBuf};
    use tempfile::{tempdir, TempDir};

    /// Remote side backed by a local directory; reads past `fail_at` error.
    struct DirRemote {
        root: PathBuf,
        fail_at: Option<u64>,
    }

    struct FailingFile {
        file: File,
        fail_at: u64,
    }

    impl Read for FailingFile {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pos = self.file.stream_position()?;
            if pos >= self.fail_at {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "remote went away"));
            }
            let cap = ((self.fail_at - pos) as usize).min(buf.len());
            self.file.read(&mut buf[..cap])
        }
    }

    impl Write for FailingFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.file.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl Seek for FailingFile {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.file.seek(pos)
        }
    }

    impl RandomAccessFile for FailingFile {
        fn length(&mut self) -> io::Result<u64> {
            self.file.length()
        }
    }

    impl RemoteFileAccess for DirRemote {
        fn open(&self, absolute_path: &str, mode: OpenMode) -> io::Result<Box<dyn RandomAccessFile>> {
            let path = self.root.join(absolute_path.trim_start_matches('/'));
            let file = match mode {
                OpenMode::Read => File::open(path)?,
                OpenMode::Write => OpenOptions::new().write(true).create(true).truncate(false).open(path)?,
            };
            Ok(match self.fail_at {
                Some(fail_at) => Box::new(FailingFile { file, fail_at }),
                None => Box::new(file),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        remote_root: PathBuf,
        local: PathBuf,
        data: Vec<u8>,
    }

    fn fixture(len: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let remote_root = dir.path().join("remote");
        std::fs::create_dir_all(&remote_root).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        std::fs::write(remote_root.join("big.dat"), &data).unwrap();
        let local = dir.path().join("big.dat");
        Fixture {
            remote_root,
            local,
            data,
            _dir: dir,
        }
    }

    fn get_processor(
        fx: &Fixture,
        manager: Arc<MemoryRestartManager>,
        control: Arc<TransferControlBlock>,
        fail_at: Option<u64>,
    ) -> RestartProcessor {
        let properties = TransferProperties {
            put_buffer_size: 1000,
            ..TransferProperties::default()
        };
        RestartProcessor::get(
            "rods#zone",
            Some(manager as Arc<dyn RestartManager>),
            Arc::new(DirRemote {
                root: fx.remote_root.clone(),
                fail_at,
            }),
            control,
            properties,
        )
    }

    fn id() -> FileRestartInfoIdentifier {
        FileRestartInfoIdentifier::new("rods#zone", "/big.dat", RestartType::Get)
    }

    /// Local file holding only the confirmed ranges; zeros elsewhere.
    fn seed_partial_get(fx: &Fixture, manager: &MemoryRestartManager, confirmed: &[(u64, u64)]) {
        let mut local = vec![0u8; fx.data.len()];
        let mut info = FileRestartInfo::new(&id(), &fx.local, fx.data.len() as u64, confirmed.len());
        for (thread, &(offset, length)) in confirmed.iter().enumerate() {
            let range = offset as usize..(offset + length) as usize;
            local[range.clone()].copy_from_slice(&fx.data[range]);
            info.segments[thread].offset = offset;
            info.segments[thread].length = length;
        }
        std::fs::write(&fx.local, &local).unwrap();
        manager.store_restart(&info).unwrap();
    }

    #[test]
    fn no_checkpoint_is_a_no_op() {
        let fx = fixture(100);
        let manager = Arc::new(MemoryRestartManager::new());
        let processor = get_processor(&fx, manager, Arc::default(), None);
        processor.restart_if_necessary("/big.dat").unwrap();
        assert!(!fx.local.exists());
    }

    #[test]
    fn missing_manager_is_fatal() {
        let fx = fixture(10);
        let processor = RestartProcessor::get(
            "rods#zone",
            None,
            Arc::new(DirRemote {
                root: fx.remote_root.clone(),
                fail_at: None,
            }),
            Arc::default(),
            TransferProperties::default(),
        );
        assert!(matches!(
            processor.restart_if_necessary("/big.dat"),
            Err(TransferFault::Restart(RestartFault::NotConfigured))
        ));
    }

    #[test]
    fn replays_only_unconfirmed_ranges() {
        let fx = fixture(10_000);
        let manager = Arc::new(MemoryRestartManager::new());
        seed_partial_get(&fx, &manager, &[(0, 2000), (5000, 1000), (7000, 500)]);
        let control = Arc::new(TransferControlBlock::default());

        get_processor(&fx, Arc::clone(&manager), Arc::clone(&control), None)
            .restart_if_necessary("/big.dat")
            .unwrap();

        assert_eq!(std::fs::read(&fx.local).unwrap(), fx.data);
        // gaps: [2000,5000) + [6000,7000) + [7500,10000)
        assert_eq!(control.total_bytes_transferred_so_far(), 3000 + 1000 + 2500);
        assert!(manager.retrieve_restart(&id()).unwrap().is_none());
    }

    #[test]
    fn overlapping_segments_are_tolerated() {
        let fx = fixture(4000);
        let manager = Arc::new(MemoryRestartManager::new());
        seed_partial_get(&fx, &manager, &[(0, 1500), (1000, 1000)]);
        let control = Arc::new(TransferControlBlock::default());

        get_processor(&fx, Arc::clone(&manager), Arc::clone(&control), None)
            .restart_if_necessary("/big.dat")
            .unwrap();

        assert_eq!(std::fs::read(&fx.local).unwrap(), fx.data);
        assert_eq!(control.total_bytes_transferred_so_far(), 2000);
    }

    #[test]
    fn failed_replay_keeps_progress_for_next_attempt() {
        let fx = fixture(6000);
        let manager = Arc::new(MemoryRestartManager::new());
        seed_partial_get(&fx, &manager, &[(0, 1000), (3000, 1000)]);

        // First attempt: the remote dies inside the trailing gap at 4000..6000.
        let first = get_processor(&fx, Arc::clone(&manager), Arc::default(), Some(4500));
        let err = first.restart_if_necessary("/big.dat").unwrap_err();
        assert!(matches!(err, TransferFault::Restart(RestartFault::Replay { .. })));

        let info = manager.retrieve_restart(&id()).unwrap().unwrap();
        assert_eq!(info.restart_attempts, 1);
        assert!(info
            .segments
            .iter()
            .any(|segment| segment.offset == 1000 && segment.length == 2000));

        // Second attempt only needs 4000..6000.
        let control = Arc::new(TransferControlBlock::default());
        get_processor(&fx, Arc::clone(&manager), Arc::clone(&control), None)
            .restart_if_necessary("/big.dat")
            .unwrap();
        assert_eq!(control.total_bytes_transferred_so_far(), 2000);
        assert_eq!(std::fs::read(&fx.local).unwrap(), fx.data);
    }

    #[test]
    fn cancelled_replay_keeps_checkpoint() {
        let fx = fixture(3000);
        let manager = Arc::new(MemoryRestartManager::new());
        seed_partial_get(&fx, &manager, &[(0, 1000)]);
        let control = Arc::new(TransferControlBlock::default());
        control.set_cancelled(true);

        let err = get_processor(&fx, Arc::clone(&manager), control, None)
            .restart_if_necessary("/big.dat")
            .unwrap_err();
        assert!(matches!(err, TransferFault::Cancelled));
        assert!(manager.retrieve_restart(&id()).unwrap().is_some());
    }

    #[test]
    fn too_many_attempts_is_fatal() {
        let fx = fixture(100);
        let manager = Arc::new(MemoryRestartManager::new());
        seed_partial_get(&fx, &manager, &[(0, 10)]);
        manager
            .update_restart(&id(), &mut |info| {
                info.restart_attempts = 5;
                Ok(())
            })
            .unwrap();

        let err = get_processor(&fx, Arc::clone(&manager), Arc::default(), None)
            .restart_if_necessary("/big.dat")
            .unwrap_err();
        assert!(matches!(
            err,
            TransferFault::Restart(RestartFault::TooManyAttempts { attempts: 6, max: 5 })
        ));
    }

    #[test]
    fn listener_receives_failure_instead_of_error() {
        let fx = fixture(100);
        let manager = Arc::new(MemoryRestartManager::new());
        let info = FileRestartInfo::new(&id(), Path::new("/definitely/not/here"), 100, 1);
        manager.store_restart(&info).unwrap();

        let (tx, rx) = unbounded();
        let processor = get_processor(&fx, Arc::clone(&manager), Arc::default(), None)
            .with_listener(Arc::new(ChannelStatusListener::new(tx, CallbackResponse::NoForAll)));
        processor.restart_if_necessary("/big.dat").unwrap();

        let states: Vec<_> = rx.try_iter().map(|status| status.state).collect();
        assert_eq!(states, vec![TransferState::Restarting, TransferState::Failure]);
        assert!(manager.retrieve_restart(&id()).unwrap().is_some());
    }

    #[test]
    fn put_replays_local_into_remote() {
        let dir = tempdir().unwrap();
        let remote_root = dir.path().join("remote");
        std::fs::create_dir_all(&remote_root).unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();
        let local = dir.path().join("up.dat");
        std::fs::write(&local, &data).unwrap();

        let mut partial = vec![0u8; data.len()];
        partial[..2500].copy_from_slice(&data[..2500]);
        std::fs::write(remote_root.join("up.dat"), &partial).unwrap();

        let put_id = FileRestartInfoIdentifier::new("rods#zone", "/up.dat", RestartType::Put);
        let manager = Arc::new(MemoryRestartManager::new());
        let mut info = FileRestartInfo::new(&put_id, &local, data.len() as u64, 2);
        info.segments[0].length = 2500;
        manager.store_restart(&info).unwrap();

        let control = Arc::new(TransferControlBlock::default());
        control.set_transfer_options(Some(TransferOptions {
            intra_file_status_callbacks: true,
            ..TransferOptions::default()
        }));
        let (tx, rx) = unbounded();
        let processor = RestartProcessor::put(
            "rods#zone",
            Some(Arc::clone(&manager) as Arc<dyn RestartManager>),
            Arc::new(DirRemote {
                root: remote_root.clone(),
                fail_at: None,
            }),
            Arc::clone(&control),
            TransferProperties::default(),
        )
        .with_listener(Arc::new(ChannelStatusListener::new(tx, CallbackResponse::NoForAll)));
        processor.restart_if_necessary("/up.dat").unwrap();

        assert_eq!(std::fs::read(remote_root.join("up.dat")).unwrap(), data);
        assert_eq!(control.total_bytes_transferred_so_far(), 2500);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|status| status.intra_file && status.bytes_transferred == 5000));
        assert_eq!(events.last().map(|status| status.state), Some(TransferState::Success));
        assert!(manager.retrieve_restart(&put_id).unwrap().is_none());
    }
}

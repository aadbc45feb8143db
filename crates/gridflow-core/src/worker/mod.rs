//! One worker per parallel socket.
//!
//! Each worker connects, presents the one-time password, and then follows
//! the server's frame headers until DONE. Workers never share buffers or file
//! handles; the only shared state is the control block and the restart
//! manager, both internally synchronized.

pub mod get;
pub mod put;

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::TransferProperties;
use crate::control::TransferControlBlock;
use crate::errors::{TransferFault, TransferResult};
use crate::restart::{FileRestartInfoIdentifier, RestartManager, RESTART_FILE_UPDATE_SIZE};
use crate::session::NegotiatedSession;
use crate::status::IntraFileProgressListener;

pub use get::GetWorker;
pub use put::PutWorker;

/// How often a paused worker re-checks the control block.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Buffered file-to-socket copy, optionally encrypted.
    PutStream,
    /// Kernel `sendfile` for plain sessions.
    PutChannel,
    GetStream,
}

impl WorkerKind {
    pub fn for_put(session: &NegotiatedSession, properties: &TransferProperties) -> Self {
        if properties.use_channel_put && !session.ssl_negotiated {
            WorkerKind::PutChannel
        } else {
            WorkerKind::PutStream
        }
    }

    pub fn for_get() -> Self {
        WorkerKind::GetStream
    }
}

/// A `[offset, offset + length)` slice of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Checkpoint target for workers of a restartable transfer.
#[derive(Clone)]
pub struct RestartTracking {
    pub manager: Arc<dyn RestartManager>,
    pub identifier: FileRestartInfoIdentifier,
}

/// Inputs shared by every worker of one transfer.
pub struct WorkerContext {
    pub session: NegotiatedSession,
    pub properties: TransferProperties,
    pub local_file: PathBuf,
    pub control: Arc<TransferControlBlock>,
    pub restart: Option<RestartTracking>,
    pub progress: Option<Arc<IntraFileProgressListener>>,
    abandon_siblings: bool,
    abandoned: AtomicBool,
}

impl WorkerContext {
    pub fn new(
        session: NegotiatedSession,
        properties: TransferProperties,
        local_file: PathBuf,
        control: Arc<TransferControlBlock>,
    ) -> Self {
        let abandon_siblings = control
            .transfer_options()
            .map(|options| options.abandon_siblings_on_failure)
            .unwrap_or(false);
        Self {
            session,
            properties,
            local_file,
            control,
            restart: None,
            progress: None,
            abandon_siblings,
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn with_restart(mut self, restart: Option<RestartTracking>) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_progress(mut self, progress: Option<Arc<IntraFileProgressListener>>) -> Self {
        self.progress = progress;
        self
    }

    /// Called between frames: fails once the transfer is cancelled or a
    /// sibling failed with abandonment enabled, and blocks while paused.
    pub fn check_between_frames(&self) -> TransferResult<()> {
        loop {
            if self.control.is_cancelled() || self.abandoned.load(Ordering::Acquire) {
                return Err(TransferFault::Cancelled);
            }
            if !self.control.is_paused() {
                return Ok(());
            }
            std::thread::sleep(PAUSE_POLL_INTERVAL);
        }
    }

    pub fn record_progress(&self, bytes: u64) {
        self.control.increment_total_bytes_transferred_so_far(bytes);
        if let Some(progress) = &self.progress {
            progress.progress(bytes);
        }
    }

    pub fn checkpoint_offset(&self, thread_number: usize, offset: u64) -> TransferResult<()> {
        if let Some(restart) = &self.restart {
            restart
                .manager
                .update_offset_for_segment(&restart.identifier, thread_number, offset)?;
        }
        Ok(())
    }

    pub fn checkpoint_length(&self, thread_number: usize, length: u64) -> TransferResult<()> {
        if length == 0 {
            return Ok(());
        }
        if let Some(restart) = &self.restart {
            restart
                .manager
                .update_length_for_segment(&restart.identifier, thread_number, length)?;
        }
        Ok(())
    }

    fn worker_failed(&self) {
        if self.abandon_siblings {
            self.abandoned.store(true, Ordering::Release);
        }
    }
}

/// Running count of bytes since the last checkpoint write.
#[derive(Debug, Default)]
pub(crate) struct CheckpointCounter {
    pending: u64,
}

impl CheckpointCounter {
    /// Add `bytes`; returns the amount to persist once the threshold is hit.
    pub(crate) fn add(&mut self, bytes: u64) -> Option<u64> {
        self.pending += bytes;
        if self.pending >= RESTART_FILE_UPDATE_SIZE {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    pub(crate) fn take(&mut self) -> u64 {
        std::mem::take(&mut self.pending)
    }
}

/// Lifecycle of one parallel connection.
pub trait TransferWorker: Send {
    fn kind(&self) -> WorkerKind;

    fn thread_number(&self) -> usize;

    /// Connect, authenticate, and move frames until DONE. Returns the
    /// number of payload bytes moved.
    fn transfer(&mut self) -> TransferResult<u64>;
}

/// Build the worker variant for `kind`. `range` is the slice a PUT worker
/// is expected to carry; GET workers learn theirs from the wire.
pub fn instance(
    kind: WorkerKind,
    thread_number: usize,
    range: Option<ByteRange>,
    context: Arc<WorkerContext>,
) -> Box<dyn TransferWorker> {
    match kind {
        WorkerKind::PutStream => Box::new(PutWorker::new(thread_number, range, context, false)),
        WorkerKind::PutChannel => Box::new(PutWorker::new(thread_number, range, context, true)),
        WorkerKind::GetStream => Box::new(GetWorker::new(thread_number, context)),
    }
}

/// Result of one worker after it ran to completion.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub thread_number: usize,
    pub bytes_transferred: u64,
    pub last_error: Option<TransferFault>,
}

/// Run a worker and capture its fault instead of propagating it.
pub fn run(mut worker: Box<dyn TransferWorker>, context: &WorkerContext) -> WorkerOutcome {
    let thread_number = worker.thread_number();
    log::debug!("worker {} ({:?}) starting", thread_number, worker.kind());
    match worker.transfer() {
        Ok(bytes) => {
            log::info!("worker {thread_number} finished, {bytes} bytes");
            WorkerOutcome {
                thread_number,
                bytes_transferred: bytes,
                last_error: None,
            }
        }
        Err(fault) => {
            match fault {
                TransferFault::Cancelled => log::info!("worker {thread_number} stopped: {fault}"),
                _ => {
                    log::error!("worker {thread_number} failed: {fault}");
                    context.worker_failed();
                }
            }
            WorkerOutcome {
                thread_number,
                bytes_transferred: 0,
                last_error: Some(fault),
            }
        }
    }
}

/// An open, authenticated parallel socket.
pub struct ParallelConnection {
    pub stream: TcpStream,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl ParallelConnection {
    /// Open the socket described by the session and apply the TCP tuning
    /// from `properties`.
    pub fn connect(session: &NegotiatedSession, properties: &TransferProperties) -> TransferResult<Self> {
        let address = session.address();
        let target = resolve(&address)?;

        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| TransferFault::transport("creating parallel socket", err))?;
        tune_socket(&socket, properties)?;

        let target = SockAddr::from(target);
        let connected = if properties.socket_timeout_secs > 0 {
            socket.connect_timeout(&target, Duration::from_secs(properties.socket_timeout_secs))
        } else {
            socket.connect(&target)
        };
        connected.map_err(|err| TransferFault::transport(format!("connecting to {address}"), err))?;
        log::info!("parallel socket connected to {address}");

        let stream: TcpStream = socket.into();
        let read_half = stream
            .try_clone()
            .map_err(|err| TransferFault::transport("cloning parallel socket", err))?;
        let write_half = stream
            .try_clone()
            .map_err(|err| TransferFault::transport("cloning parallel socket", err))?;

        let reader: Box<dyn Read + Send> = match properties.input_buffer_size {
            size if size < 0 => Box::new(read_half),
            0 => Box::new(BufReader::new(read_half)),
            size => Box::new(BufReader::with_capacity(size as usize, read_half)),
        };
        let writer: Box<dyn Write + Send> = match properties.output_buffer_size {
            size if size < 0 => Box::new(write_half),
            0 => Box::new(BufWriter::new(write_half)),
            size => Box::new(BufWriter::with_capacity(size as usize, write_half)),
        };

        Ok(Self {
            stream,
            reader,
            writer,
        })
    }
}

fn resolve(address: &str) -> TransferResult<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|err| TransferFault::transport(format!("resolving {address}"), err))?
        .next()
        .ok_or_else(|| TransferFault::Configuration(format!("no address found for {address}")))
}

fn tune_socket(socket: &Socket, properties: &TransferProperties) -> TransferResult<()> {
    if properties.tcp_send_window_kib > 0 {
        socket
            .set_send_buffer_size(properties.tcp_send_window_kib * 1024)
            .map_err(|err| TransferFault::transport("setting send buffer size", err))?;
    }
    if properties.tcp_receive_window_kib > 0 {
        socket
            .set_recv_buffer_size(properties.tcp_receive_window_kib * 1024)
            .map_err(|err| TransferFault::transport("setting receive buffer size", err))?;
    }
    socket
        .set_keepalive(properties.tcp_keep_alive)
        .map_err(|err| TransferFault::transport("setting SO_KEEPALIVE", err))?;
    socket
        .set_tcp_nodelay(properties.tcp_nodelay)
        .map_err(|err| TransferFault::transport("setting TCP_NODELAY", err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| TransferFault::transport("setting SO_REUSEADDR", err))?;
    if properties.socket_timeout_secs > 0 {
        let timeout = Some(Duration::from_secs(properties.socket_timeout_secs));
        socket
            .set_read_timeout(timeout)
            .map_err(|err| TransferFault::transport("setting read timeout", err))?;
        socket
            .set_write_timeout(timeout)
            .map_err(|err| TransferFault::transport("setting write timeout", err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TransferOptions;

    #[test]
    fn channel_put_only_without_encryption() {
        let mut properties = TransferProperties::default();
        let session = NegotiatedSession::plain("h", 1, 2, 3);
        assert_eq!(WorkerKind::for_put(&session, &properties), WorkerKind::PutStream);

        properties.use_channel_put = true;
        assert_eq!(WorkerKind::for_put(&session, &properties), WorkerKind::PutChannel);

        let encrypted = session.with_encryption(b"k".to_vec(), Default::default());
        assert_eq!(WorkerKind::for_put(&encrypted, &properties), WorkerKind::PutStream);
    }

    #[test]
    fn checkpoint_counter_fires_at_threshold() {
        let mut counter = CheckpointCounter::default();
        assert_eq!(counter.add(RESTART_FILE_UPDATE_SIZE - 1), None);
        assert_eq!(counter.add(2), Some(RESTART_FILE_UPDATE_SIZE + 1));
        assert_eq!(counter.add(5), None);
        assert_eq!(counter.take(), 5);
        assert_eq!(counter.take(), 0);
    }

    fn context(control: Arc<TransferControlBlock>) -> WorkerContext {
        WorkerContext::new(
            NegotiatedSession::plain("h", 1, 2, 3),
            TransferProperties::default(),
            PathBuf::from("/tmp/x"),
            control,
        )
    }

    #[test]
    fn cancellation_is_seen_between_frames() {
        let control = Arc::new(TransferControlBlock::default());
        let ctx = context(Arc::clone(&control));
        ctx.check_between_frames().unwrap();
        control.set_cancelled(true);
        assert!(matches!(ctx.check_between_frames(), Err(TransferFault::Cancelled)));
    }

    #[test]
    fn sibling_failure_only_stops_when_enabled() {
        let control = Arc::new(TransferControlBlock::default());
        let ctx = context(Arc::clone(&control));
        ctx.worker_failed();
        ctx.check_between_frames().unwrap();

        control.set_transfer_options(Some(TransferOptions {
            abandon_siblings_on_failure: true,
            ..TransferOptions::default()
        }));
        let ctx = context(control);
        ctx.worker_failed();
        assert!(matches!(ctx.check_between_frames(), Err(TransferFault::Cancelled)));
    }

    #[test]
    fn paused_worker_resumes() {
        let control = Arc::new(TransferControlBlock::default());
        control.set_paused(true);
        let ctx = Arc::new(context(Arc::clone(&control)));
        let waiter = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.check_between_frames())
        };
        std::thread::sleep(Duration::from_millis(50));
        control.set_paused(false);
        waiter.join().unwrap().unwrap();
    }
}

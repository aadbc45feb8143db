//! Zero-copy file-to-socket primitives for the channel PUT worker.

#[cfg(all(unix, not(target_os = "macos")))]
use std::os::unix::io::RawFd;

/// Result of a zero-copy attempt over one range.
#[derive(Debug, PartialEq, Eq)]
pub enum ZeroCopyResult {
    /// `bytes` were handed to the kernel; the file offset is now `new_offset`.
    Copied { bytes: usize, new_offset: u64 },
    /// The kernel cannot do this transfer; fall back to a buffered copy.
    Unsupported,
}

/// Attempts to use `sendfile` to move data from a file descriptor to a socket.
/// Returns `(bytes_sent, new_offset)`; a would-block condition reports zero.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn sendfile_chunk(socket_fd: RawFd, file_fd: RawFd, offset: u64, len: usize) -> std::io::Result<(usize, u64)> {
    use std::io;
    let mut off = offset as libc::off_t;
    loop {
        let res = unsafe { libc::sendfile(socket_fd, file_fd, &mut off, len) };
        if res >= 0 {
            return Ok((res as usize, off as u64));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR => continue,
            Some(code) if code == libc::EAGAIN => return Ok((0, offset)),
            _ => return Err(err),
        }
    }
}

/// Push exactly `len` bytes of `file` starting at `offset` into `socket`.
///
/// Returns `Unsupported` only if nothing was sent yet, so the caller can
/// redo the whole range with a buffered copy without corrupting the frame.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn sendfile_range(
    socket: &std::net::TcpStream,
    file: &std::fs::File,
    offset: u64,
    len: u64,
) -> std::io::Result<ZeroCopyResult> {
    use std::io;
    use std::os::unix::io::AsRawFd;

    // Keep single calls well under the 2 GiB sendfile ceiling.
    const MAX_SENDFILE: u64 = 1 << 30;

    let mut sent = 0u64;
    let mut cursor = offset;
    let mut idle_spins = 0u32;
    while sent < len {
        let chunk = (len - sent).min(MAX_SENDFILE) as usize;
        match sendfile_chunk(socket.as_raw_fd(), file.as_raw_fd(), cursor, chunk) {
            Ok((0, _)) => {
                // Zero means EAGAIN or the file ended under us.
                idle_spins += 1;
                if idle_spins > 100 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("sendfile made no progress at offset {cursor}"),
                    ));
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Ok((bytes, new_offset)) => {
                idle_spins = 0;
                sent += bytes as u64;
                cursor = new_offset;
            }
            Err(err) => {
                let unsupported = matches!(err.raw_os_error(), Some(code) if code == libc::EINVAL || code == libc::ENOSYS);
                if unsupported && sent == 0 {
                    return Ok(ZeroCopyResult::Unsupported);
                }
                return Err(err);
            }
        }
    }
    Ok(ZeroCopyResult::Copied {
        bytes: sent as usize,
        new_offset: cursor,
    })
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
pub fn sendfile_range(
    _socket: &std::net::TcpStream,
    _file: &std::fs::File,
    _offset: u64,
    _len: u64,
) -> std::io::Result<ZeroCopyResult> {
    Ok(ZeroCopyResult::Unsupported)
}

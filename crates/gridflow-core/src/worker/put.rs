use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use super::{ByteRange, CheckpointCounter, ParallelConnection, TransferWorker, WorkerContext, WorkerKind};
use crate::crypto::{cipher_for_session, ParallelCipher};
use crate::errors::{TransferFault, TransferResult};
use crate::protocol::{self, FrameHeader, Operation};
use crate::zero_copy::{sendfile_range, ZeroCopyResult};

/// Streams local file ranges to the server as it requests them.
pub struct PutWorker {
    thread_number: usize,
    range: Option<ByteRange>,
    context: Arc<WorkerContext>,
    zero_copy: bool,
}

impl PutWorker {
    pub fn new(thread_number: usize, range: Option<ByteRange>, context: Arc<WorkerContext>, zero_copy: bool) -> Self {
        Self {
            thread_number,
            range,
            context,
            zero_copy,
        }
    }

    fn send_buffered(
        &self,
        file: &mut File,
        writer: &mut dyn Write,
        cipher: Option<&dyn ParallelCipher>,
        buffer: &mut [u8],
        header: &FrameHeader,
    ) -> TransferResult<u64> {
        file.seek(SeekFrom::Start(header.offset))
            .map_err(|err| TransferFault::transport("seeking local file", err))?;

        let mut remaining = header.length;
        let mut total_read = 0u64;
        let mut total_written = 0u64;
        let mut checkpoint = CheckpointCounter::default();
        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let read = file
                .read(&mut buffer[..want])
                .map_err(|err| TransferFault::transport("reading local file", err))?;
            if read == 0 {
                log::error!("local file ended with {remaining} bytes of frame left");
                break;
            }
            total_read += read as u64;
            remaining -= read as u64;

            match cipher {
                Some(cipher) => {
                    protocol::write_encrypted_chunk(writer, cipher, &buffer[..read])?;
                }
                None => writer
                    .write_all(&buffer[..read])
                    .map_err(|err| TransferFault::transport("writing to parallel socket", err))?,
            }
            total_written += read as u64;

            self.context.record_progress(read as u64);
            if let Some(length) = checkpoint.add(read as u64) {
                writer
                    .flush()
                    .map_err(|err| TransferFault::transport("flushing parallel socket", err))?;
                self.context.checkpoint_length(self.thread_number, length)?;
            }
        }

        writer
            .flush()
            .map_err(|err| TransferFault::transport("flushing parallel socket", err))?;
        self.context.checkpoint_length(self.thread_number, checkpoint.take())?;

        if total_read != total_written || remaining != 0 {
            return Err(TransferFault::ByteCountMismatch {
                expected: header.length,
                actual: total_written,
            });
        }
        Ok(total_written)
    }

    /// Returns `None` when the kernel refused and nothing was sent.
    fn send_zero_copy(&self, file: &File, connection: &mut ParallelConnection, header: &FrameHeader) -> TransferResult<Option<u64>> {
        connection
            .writer
            .flush()
            .map_err(|err| TransferFault::transport("flushing parallel socket", err))?;
        match sendfile_range(&connection.stream, file, header.offset, header.length)
            .map_err(|err| TransferFault::transport("sendfile to parallel socket", err))?
        {
            ZeroCopyResult::Copied { bytes, .. } => {
                let bytes = bytes as u64;
                if bytes != header.length {
                    return Err(TransferFault::ByteCountMismatch {
                        expected: header.length,
                        actual: bytes,
                    });
                }
                self.context.record_progress(bytes);
                self.context.checkpoint_length(self.thread_number, bytes)?;
                Ok(Some(bytes))
            }
            ZeroCopyResult::Unsupported => Ok(None),
        }
    }
}

impl TransferWorker for PutWorker {
    fn kind(&self) -> WorkerKind {
        if self.zero_copy {
            WorkerKind::PutChannel
        } else {
            WorkerKind::PutStream
        }
    }

    fn thread_number(&self) -> usize {
        self.thread_number
    }

    fn transfer(&mut self) -> TransferResult<u64> {
        let ctx = Arc::clone(&self.context);
        if let Some(range) = self.range {
            log::debug!(
                "put worker {} assigned [{}, {})",
                self.thread_number,
                range.offset,
                range.end()
            );
        }

        let mut file = File::open(&ctx.local_file)
            .map_err(|err| TransferFault::transport(format!("opening {}", ctx.local_file.display()), err))?;
        let mut connection = ParallelConnection::connect(&ctx.session, &ctx.properties)?;
        protocol::write_cookie(&mut connection.writer, ctx.session.one_time_password)?;
        log::debug!("cookie written for put worker {}", self.thread_number);

        let cipher = if ctx.session.ssl_negotiated {
            Some(cipher_for_session(&ctx.session)?)
        } else {
            None
        };
        let mut buffer = vec![0u8; ctx.properties.parallel_copy_buffer_size];
        let mut total = 0u64;

        loop {
            ctx.check_between_frames()?;
            let header = FrameHeader::read_from(&mut connection.reader)?;
            match header.operation {
                Operation::Done => {
                    log::info!("done received by put worker {}", self.thread_number);
                    break;
                }
                Operation::Put => {}
                other => {
                    return Err(TransferFault::protocol(format!(
                        "parallel put expected PUT, server requested {other:?}"
                    )))
                }
            }
            log::debug!(
                "put worker {} frame offset {} length {}",
                self.thread_number,
                header.offset,
                header.length
            );
            ctx.checkpoint_offset(self.thread_number, header.offset)?;

            let zero_copied = if self.zero_copy {
                let sent = self.send_zero_copy(&file, &mut connection, &header)?;
                if sent.is_none() {
                    log::debug!("sendfile unsupported, falling back to buffered copy");
                    self.zero_copy = false;
                }
                sent
            } else {
                None
            };
            total += match zero_copied {
                Some(bytes) => bytes,
                None => self.send_buffered(
                    &mut file,
                    &mut connection.writer,
                    cipher.as_deref(),
                    &mut buffer,
                    &header,
                )?,
            };
        }

        connection
            .writer
            .flush()
            .map_err(|err| TransferFault::transport("flushing parallel socket", err))?;
        Ok(total)
    }
}

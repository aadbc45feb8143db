use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use super::{CheckpointCounter, ParallelConnection, TransferWorker, WorkerContext, WorkerKind};
use crate::crypto::{cipher_for_session, ParallelCipher};
use crate::errors::{TransferFault, TransferResult};
use crate::protocol::{self, FrameHeader, Operation};

/// Receives the ranges the server pushes and writes them into the local file.
pub struct GetWorker {
    thread_number: usize,
    context: Arc<WorkerContext>,
}

impl GetWorker {
    pub fn new(thread_number: usize, context: Arc<WorkerContext>) -> Self {
        Self {
            thread_number,
            context,
        }
    }

    fn receive_frame(
        &self,
        file: &mut File,
        reader: &mut dyn Read,
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
            let chunk = match cipher {
                Some(cipher) => {
                    let plain = protocol::read_encrypted_chunk(reader, cipher).map_err(|fault| stall_on_eof(fault, remaining))?;
                    if plain.is_empty() {
                        return Err(TransferFault::Stalled { remaining });
                    }
                    if plain.len() as u64 > remaining {
                        return Err(TransferFault::ByteCountMismatch {
                            expected: header.length,
                            actual: total_read + plain.len() as u64,
                        });
                    }
                    Chunk::Owned(plain)
                }
                None => {
                    let want = remaining.min(buffer.len() as u64) as usize;
                    let read = read_some(reader, &mut buffer[..want])?;
                    if read == 0 {
                        log::error!(
                            "get worker {} read nothing with {remaining} bytes outstanding",
                            self.thread_number
                        );
                        return Err(TransferFault::Stalled { remaining });
                    }
                    Chunk::Borrowed(read)
                }
            };
            let bytes = match &chunk {
                Chunk::Owned(plain) => plain.as_slice(),
                Chunk::Borrowed(read) => &buffer[..*read],
            };
            total_read += bytes.len() as u64;

            file.write_all(bytes)
                .map_err(|err| TransferFault::transport("writing local file", err))?;
            let written = bytes.len() as u64;
            total_written += written;
            remaining -= written;

            self.context.record_progress(written);
            if let Some(length) = checkpoint.add(written) {
                self.context.checkpoint_length(self.thread_number, length)?;
            }
        }
        self.context.checkpoint_length(self.thread_number, checkpoint.take())?;

        if total_read != total_written || total_written != header.length {
            return Err(TransferFault::ByteCountMismatch {
                expected: header.length,
                actual: total_written,
            });
        }
        Ok(total_written)
    }
}

enum Chunk {
    Owned(Vec<u8>),
    Borrowed(usize),
}

/// One `read`, retried on EINTR.
fn read_some(reader: &mut dyn Read, buf: &mut [u8]) -> TransferResult<usize> {
    loop {
        match reader.read(buf) {
            Ok(read) => return Ok(read),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransferFault::transport("reading parallel socket", err)),
        }
    }
}

fn stall_on_eof(fault: TransferFault, remaining: u64) -> TransferFault {
    match fault {
        TransferFault::Transport { source, .. } if source.kind() == io::ErrorKind::UnexpectedEof => {
            TransferFault::Stalled { remaining }
        }
        other => other,
    }
}

impl TransferWorker for GetWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::GetStream
    }

    fn thread_number(&self) -> usize {
        self.thread_number
    }

    fn transfer(&mut self) -> TransferResult<u64> {
        let ctx = Arc::clone(&self.context);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&ctx.local_file)
            .map_err(|err| TransferFault::transport(format!("opening {}", ctx.local_file.display()), err))?;
        let mut connection = ParallelConnection::connect(&ctx.session, &ctx.properties)?;
        protocol::write_cookie(&mut connection.writer, ctx.session.one_time_password)?;
        log::debug!("cookie written for get worker {}", self.thread_number);

        let cipher = if ctx.session.ssl_negotiated {
            Some(cipher_for_session(&ctx.session)?)
        } else {
            None
        };

        ctx.check_between_frames()?;
        let mut header = FrameHeader::read_from(&mut connection.reader)?;
        if header.operation != Operation::Get {
            log::error!("parallel get expected GET, server requested {:?}", header.operation);
            return Err(TransferFault::protocol(format!(
                "parallel get expected GET, server requested {:?}",
                header.operation
            )));
        }
        if header.length == 0 {
            log::info!("get worker {} was handed an empty first frame", self.thread_number);
            return Ok(0);
        }

        let mut buffer = vec![0u8; ctx.properties.parallel_copy_buffer_size];
        let mut total = 0u64;
        loop {
            match header.operation {
                Operation::Done => {
                    log::info!("done received by get worker {}", self.thread_number);
                    break;
                }
                Operation::Get => {}
                other => {
                    return Err(TransferFault::protocol(format!(
                        "parallel get expected GET, server requested {other:?}"
                    )))
                }
            }
            log::debug!(
                "get worker {} frame offset {} length {}",
                self.thread_number,
                header.offset,
                header.length
            );
            ctx.checkpoint_offset(self.thread_number, header.offset)?;
            total += self.receive_frame(
                &mut file,
                &mut connection.reader,
                cipher.as_deref(),
                &mut buffer,
                &header,
            )?;

            ctx.check_between_frames()?;
            header = FrameHeader::read_from(&mut connection.reader)?;
        }

        file.flush()
            .map_err(|err| TransferFault::transport("flushing local file", err))?;
        Ok(total)
    }
}

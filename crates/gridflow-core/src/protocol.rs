//! Framing for parallel-transfer sockets.
//!
//! Every connection starts with the 4-byte one-time password. After that the
//! server drives the exchange with 24-byte headers
//! (`operation:i32, flags:i32, offset:i64, length:i64`, all big-endian), each
//! followed by `length` payload bytes unless the operation is DONE.

use std::io::{Read, Write};

use crate::crypto::{EncryptionBuffer, ParallelCipher};
use crate::errors::{TransferFault, TransferResult};

pub const PUT_OPR: i32 = 1;
pub const GET_OPR: i32 = 2;
pub const DONE_OPR: i32 = 9999;

pub const HEADER_LEN: usize = 24;
pub const COOKIE_LEN: usize = 4;

/// Upper bound for one encrypted chunk on the wire (IV + padded ciphertext).
pub const MAX_ENCRYPTED_CHUNK: usize = 64 * 1024 * 1024 + 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Put,
    Get,
    Done,
}

impl Operation {
    pub fn code(self) -> i32 {
        match self {
            Operation::Put => PUT_OPR,
            Operation::Get => GET_OPR,
            Operation::Done => DONE_OPR,
        }
    }
}

impl TryFrom<i32> for Operation {
    type Error = TransferFault;

    fn try_from(code: i32) -> TransferResult<Self> {
        match code {
            PUT_OPR => Ok(Operation::Put),
            GET_OPR => Ok(Operation::Get),
            DONE_OPR => Ok(Operation::Done),
            other => Err(TransferFault::protocol(format!(
                "unknown operation {other} received on parallel socket"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub operation: Operation,
    pub flags: i32,
    pub offset: u64,
    pub length: u64,
}

impl FrameHeader {
    pub fn new(operation: Operation, offset: u64, length: u64) -> Self {
        Self {
            operation,
            flags: 0,
            offset,
            length,
        }
    }

    pub fn done() -> Self {
        Self::new(Operation::Done, 0, 0)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.operation.code().to_be_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&(self.offset as i64).to_be_bytes());
        buf[16..24].copy_from_slice(&(self.length as i64).to_be_bytes());
        buf
    }

    /// Parse a header. Negative offsets or lengths on a data frame are
    /// protocol errors; DONE frames are accepted regardless of their fields.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> TransferResult<Self> {
        let operation = Operation::try_from(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))?;
        let flags = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let offset = i64::from_be_bytes(buf[8..16].try_into().unwrap_or_default());
        let length = i64::from_be_bytes(buf[16..24].try_into().unwrap_or_default());

        if operation == Operation::Done {
            return Ok(Self::done());
        }
        if offset < 0 {
            return Err(TransferFault::protocol(format!("negative offset {offset} in header")));
        }
        if length < 0 {
            return Err(TransferFault::protocol(format!("negative length {length} in header")));
        }
        Ok(Self {
            operation,
            flags,
            offset: offset as u64,
            length: length as u64,
        })
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> TransferResult<Self> {
        let mut buf = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut buf)
            .map_err(|err| TransferFault::transport("reading frame header", err))?;
        Self::decode(&buf)
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> TransferResult<()> {
        writer
            .write_all(&self.encode())
            .map_err(|err| TransferFault::transport("writing frame header", err))
    }
}

pub fn write_cookie<W: Write + ?Sized>(writer: &mut W, password: i32) -> TransferResult<()> {
    writer
        .write_all(&password.to_be_bytes())
        .and_then(|_| writer.flush())
        .map_err(|err| TransferFault::transport("writing one-time password", err))
}

pub fn read_cookie<R: Read + ?Sized>(reader: &mut R) -> TransferResult<i32> {
    let mut buf = [0u8; COOKIE_LEN];
    reader
        .read_exact(&mut buf)
        .map_err(|err| TransferFault::transport("reading one-time password", err))?;
    Ok(i32::from_be_bytes(buf))
}

/// Seal `plain` and write it as `len:i32 || iv || ciphertext`.
/// Returns the number of bytes put on the wire.
pub fn write_encrypted_chunk<W: Write + ?Sized>(
    writer: &mut W,
    cipher: &dyn ParallelCipher,
    plain: &[u8],
) -> TransferResult<usize> {
    let sealed = cipher.encrypt(plain)?;
    let wire_len = sealed.wire_len();
    let prefix = i32::try_from(wire_len)
        .map_err(|_| TransferFault::Cipher(format!("encrypted chunk of {wire_len} bytes too large")))?;

    writer
        .write_all(&prefix.to_be_bytes())
        .and_then(|_| writer.write_all(&sealed.initialization_vector))
        .and_then(|_| writer.write_all(&sealed.encrypted_data))
        .map_err(|err| TransferFault::transport("writing encrypted chunk", err))?;
    Ok(wire_len + 4)
}

/// Read one `len:i32 || iv || ciphertext` chunk and return the plaintext.
pub fn read_encrypted_chunk<R: Read + ?Sized>(
    reader: &mut R,
    cipher: &dyn ParallelCipher,
) -> TransferResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|err| TransferFault::transport("reading encrypted chunk length", err))?;
    let wire_len = i32::from_be_bytes(len_buf);
    let iv_len = cipher.iv_len();
    if wire_len < iv_len as i32 || wire_len as usize > MAX_ENCRYPTED_CHUNK {
        return Err(TransferFault::protocol(format!(
            "encrypted chunk length {wire_len} out of range"
        )));
    }

    let mut raw = vec![0u8; wire_len as usize];
    reader
        .read_exact(&mut raw)
        .map_err(|err| TransferFault::transport("reading encrypted chunk", err))?;
    let encrypted_data = raw.split_off(iv_len);
    cipher.decrypt(&EncryptionBuffer {
        initialization_vector: raw,
        encrypted_data,
    })
}

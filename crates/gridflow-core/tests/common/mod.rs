//! Scripted stand-in for the grid server's side of the parallel sockets.
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use gridflow_core::NegotiatedSession;

pub const COOKIE: i32 = 424_242;

pub const PUT: i32 = 1;
pub const GET: i32 = 2;
pub const DONE: i32 = 9999;

/// Accepts a fixed number of connections and runs `handler` on each, with
/// the accept order as its index.
pub struct FakeServer {
    port: u16,
    handle: JoinHandle<Vec<io::Result<()>>>,
}

impl FakeServer {
    pub fn start<F>(connections: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(usize, TcpStream) -> io::Result<()> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let handler = Arc::new(handler);
        let handle = thread::spawn(move || {
            let mut handlers = Vec::with_capacity(connections);
            for index in 0..connections {
                let stream = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(err) => return vec![Err(err)],
                };
                let handler = Arc::clone(&handler);
                handlers.push(thread::spawn(move || handler(index, stream)));
            }
            handlers
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(io::Error::other("connection handler panicked")))
                })
                .collect()
        });
        Ok(Self { port, handle })
    }

    pub fn session(&self, threads: usize) -> NegotiatedSession {
        NegotiatedSession::plain("127.0.0.1", self.port, threads, COOKIE)
    }

    /// Wait for every handler and fail on the first error any of them hit.
    pub fn finish(self) -> io::Result<()> {
        let results = self
            .handle
            .join()
            .map_err(|_| io::Error::other("accept loop panicked"))?;
        results.into_iter().collect()
    }
}

pub fn expect_cookie(stream: &mut TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    let cookie = i32::from_be_bytes(buf);
    if cookie != COOKIE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected cookie {cookie}"),
        ));
    }
    Ok(())
}

/// Header written by hand so the tests do not depend on the encoder under test.
pub fn send_header(stream: &mut TcpStream, operation: i32, offset: i64, length: i64) -> io::Result<()> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&operation.to_be_bytes());
    buf.extend_from_slice(&0i32.to_be_bytes());
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    stream.write_all(&buf)?;
    stream.flush()
}

pub fn send_done(stream: &mut TcpStream) -> io::Result<()> {
    send_header(stream, DONE, 0, 0)
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

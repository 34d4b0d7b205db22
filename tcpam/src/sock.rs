//! Non-blocking socket primitives.
//!
//! Every primitive folds "would block" into zero progress, retries on
//! `EINTR` and reports anything else as a hard error.

use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

/// A connected, non-blocking byte stream.
pub trait Socket: Send {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn sendv(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn raw_fd(&self) -> RawFd;
}

impl<T> Socket for T
where
    T: Read + Write + AsRawFd + Send,
{
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn sendv(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.write_vectored(bufs)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

/// Outcome of a non-blocking read.
#[derive(Debug)]
pub enum RecvStatus {
    /// `n > 0` bytes were read.
    Data(usize),
    /// Nothing to read right now.
    NoData,
    /// The peer shut the stream down.
    Closed,
    Failed(io::Error),
}

/// Write as much of `buf` as the socket accepts. `Ok(0)` means no progress.
pub fn send_nb(sock: &mut dyn Socket, buf: &[u8]) -> io::Result<usize> {
    loop {
        match sock.send(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}

/// Vectored variant of [`send_nb`].
pub fn sendv_nb(sock: &mut dyn Socket, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    loop {
        match sock.sendv(bufs) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}

pub fn recv_nb(sock: &mut dyn Socket, buf: &mut [u8]) -> RecvStatus {
    debug_assert!(!buf.is_empty());
    loop {
        match sock.recv(buf) {
            Ok(0) => return RecvStatus::Closed,
            Ok(n) => return RecvStatus::Data(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return RecvStatus::NoData,
            Err(e) => return RecvStatus::Failed(e),
        }
    }
}

/// Starts outbound connections.
pub trait Connector: Send {
    /// Begin a non-blocking connect to `peer`. Completion is signalled by
    /// write readiness on the returned socket.
    fn connect(&mut self, peer: SocketAddr) -> io::Result<Box<dyn Socket>>;
}

/// [`Connector`] producing `mio` TCP streams.
#[derive(Debug, Default)]
pub struct MioConnector {
    pub nodelay: bool,
}

impl MioConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }
}

impl Connector for MioConnector {
    fn connect(&mut self, peer: SocketAddr) -> io::Result<Box<dyn Socket>> {
        let stream = mio::net::TcpStream::connect(peer)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Box::new(stream))
    }
}

//! Socket connection-manager client endpoint.
//!
//! Unlike [`crate::TcpIface`] endpoints, a [`SockCmEp`] is advanced by an
//! asynchronous event thread through a [`SockCmHandle`]. State and queued
//! flush completions live behind a mutex shared by both sides; failures seen
//! on the event thread are deferred to the owner's [`SockCmEp::progress`].

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::deferred::DeferredQueue;
use crate::endpoint::{Completion, Endpoint, SendStatus};
use crate::error::{Result, TcpAmError};
use crate::pending::PendingOp;
use crate::sock::{Connector, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockCmState {
    /// Non-blocking connect in flight.
    SockConnecting,
    SockConnected,
    /// Connection info delivered to the server.
    InfoSent,
    Connected,
    Closed,
}

impl fmt::Display for SockCmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SockCmState::SockConnecting => "SOCK_CONNECTING",
            SockCmState::SockConnected => "SOCK_CONNECTED",
            SockCmState::InfoSent => "INFO_SENT",
            SockCmState::Connected => "CONNECTED",
            SockCmState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

struct Shared {
    state: SockCmState,
    ops: VecDeque<Completion>,
}

impl Shared {
    /// Run every queued completion with `status`, releasing the lock
    /// around each call.
    fn invoke_completions(guard: &mut MutexGuard<'_, Shared>, status: impl Fn() -> Result<()>) {
        while let Some(comp) = guard.ops.pop_front() {
            MutexGuard::unlocked(guard, || comp(status()));
        }
    }
}

/// Event-thread side of a [`SockCmEp`].
#[derive(Clone)]
pub struct SockCmHandle {
    shared: Arc<Mutex<Shared>>,
    failures: DeferredQueue<TcpAmError>,
}

impl SockCmHandle {
    fn advance(&self, from: &[SockCmState], to: SockCmState) -> bool {
        let mut shared = self.shared.lock();
        if !from.contains(&shared.state) {
            trace!(state = %shared.state, to = %to, "sockcm transition ignored");
            return false;
        }
        debug!(from = %shared.state, to = %to, "sockcm state changed");
        shared.state = to;
        true
    }

    /// The non-blocking connect finished.
    pub fn on_sock_connected(&self) -> bool {
        self.advance(&[SockCmState::SockConnecting], SockCmState::SockConnected)
    }

    /// The client's connection info reached the server.
    pub fn on_info_sent(&self) -> bool {
        self.advance(&[SockCmState::SockConnected], SockCmState::InfoSent)
    }

    /// The server accepted the connection; completes queued flushes.
    pub fn on_connected(&self) -> bool {
        let mut shared = self.shared.lock();
        if matches!(shared.state, SockCmState::Connected | SockCmState::Closed) {
            return false;
        }
        debug!(from = %shared.state, "sockcm connected");
        shared.state = SockCmState::Connected;
        Shared::invoke_completions(&mut shared, || Ok(()));
        true
    }

    /// Report a failure; handled by the owner's next progress call.
    pub fn set_failed(&self, status: TcpAmError) {
        debug!("sockcm endpoint failed: {status}");
        self.failures.push(status);
    }

    pub fn state(&self) -> SockCmState {
        self.shared.lock().state
    }
}

pub struct SockCmEp {
    peer_addr: SocketAddr,
    fd: RawFd,
    socket: Option<Box<dyn Socket>>,
    shared: Arc<Mutex<Shared>>,
    failures: DeferredQueue<TcpAmError>,
    err_handler: Option<Box<dyn FnMut(&TcpAmError) + Send>>,
}

impl SockCmEp {
    /// Start a non-blocking connect to `peer_addr`.
    pub fn connect(
        connector: &mut dyn Connector,
        peer_addr: SocketAddr,
    ) -> Result<(Self, SockCmHandle)> {
        let socket = connector.connect(peer_addr).map_err(|err| {
            debug!(peer = %peer_addr, "sockcm connect failed: {err}");
            TcpAmError::Io(err)
        })?;
        let fd = socket.raw_fd();
        let shared = Arc::new(Mutex::new(Shared {
            state: SockCmState::SockConnecting,
            ops: VecDeque::new(),
        }));
        let failures = DeferredQueue::new();
        debug!(peer = %peer_addr, fd, "created sockcm endpoint");
        let handle = SockCmHandle {
            shared: Arc::clone(&shared),
            failures: failures.clone(),
        };
        let ep = Self {
            peer_addr,
            fd,
            socket: Some(socket),
            shared,
            failures,
            err_handler: None,
        };
        Ok((ep, handle))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> SockCmState {
        self.shared.lock().state
    }

    pub fn set_err_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&TcpAmError) + Send + 'static,
    {
        self.err_handler = Some(Box::new(handler));
    }

    /// Flush: done once connected. Before that, a completion is queued
    /// until the connection is established or fails.
    pub fn flush_nb(&mut self, comp: Option<Completion>) -> Result<SendStatus> {
        let mut shared = self.shared.lock();
        match shared.state {
            SockCmState::Connected => Ok(SendStatus::Done),
            SockCmState::Closed => Err(TcpAmError::Unreachable),
            _ => match comp {
                Some(comp) => {
                    shared.ops.push_back(comp);
                    trace!(fd = self.fd, ops = shared.ops.len(), "sockcm flush queued");
                    Ok(SendStatus::InProgress)
                }
                None => Err(TcpAmError::NoResource),
            },
        }
    }

    /// Handle failures reported by the event thread.
    pub fn progress(&mut self) -> usize {
        let mut count = 0;
        while let Some(status) = self.failures.pop() {
            {
                let mut shared = self.shared.lock();
                if shared.state == SockCmState::Closed {
                    continue;
                }
                shared.state = SockCmState::Closed;
                Shared::invoke_completions(&mut shared, || Err(TcpAmError::Unreachable));
            }
            self.socket = None;
            count += 1;
            match self.err_handler.as_mut() {
                Some(handler) => handler(&status),
                None => warn!(peer = %self.peer_addr, "sockcm endpoint failed: {status}"),
            }
        }
        count
    }
}

impl Endpoint for SockCmEp {
    fn am_short(&mut self, _am_id: u8, _header: u64, _payload: &[u8]) -> Result<()> {
        Err(TcpAmError::Unsupported)
    }

    fn am_bcopy(
        &mut self,
        _am_id: u8,
        _pack: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<usize> {
        Err(TcpAmError::Unsupported)
    }

    fn am_zcopy(
        &mut self,
        _am_id: u8,
        _header: &[u8],
        _iov: &[Bytes],
        _comp: Option<Completion>,
    ) -> Result<SendStatus> {
        Err(TcpAmError::Unsupported)
    }

    fn pending_add(&mut self, _op: Box<dyn PendingOp>) -> Result<()> {
        Err(TcpAmError::Unsupported)
    }

    fn pending_purge(&mut self, _cb: &mut dyn FnMut(Box<dyn PendingOp>)) {}

    fn flush(&mut self) -> Result<()> {
        self.flush_nb(None).map(|_| ())
    }
}

impl Drop for SockCmEp {
    fn drop(&mut self) {
        let shared = self.shared.lock();
        if !shared.ops.is_empty() {
            warn!(
                peer = %self.peer_addr,
                ops = shared.ops.len(),
                "destroying sockcm endpoint with incomplete operations"
            );
        }
        debug!(peer = %self.peer_addr, fd = self.fd, "sockcm endpoint destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PairConnector;

    impl Connector for PairConnector {
        fn connect(&mut self, _peer: SocketAddr) -> io::Result<Box<dyn Socket>> {
            let (a, _b) = UnixStream::pair()?;
            Ok(Box::new(a))
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect(&mut self, _peer: SocketAddr) -> io::Result<Box<dyn Socket>> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }

    #[test]
    fn flush_waits_for_connection() {
        let (mut ep, handle) = SockCmEp::connect(&mut PairConnector, peer()).unwrap();
        assert_eq!(ep.state(), SockCmState::SockConnecting);
        assert!(matches!(ep.flush(), Err(TcpAmError::NoResource)));

        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let status = ep
            .flush_nb(Some(Box::new(move |res: Result<()>| {
                assert!(res.is_ok());
                d.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        assert_eq!(status, SendStatus::InProgress);

        assert!(handle.on_sock_connected());
        assert!(!handle.on_sock_connected());
        assert!(handle.on_info_sent());
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert!(handle.on_connected());
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(ep.flush_nb(None).unwrap(), SendStatus::Done);
    }

    #[test]
    fn completion_may_inspect_endpoint() {
        let (mut ep, handle) = SockCmEp::connect(&mut PairConnector, peer()).unwrap();
        let h = handle.clone();
        ep.flush_nb(Some(Box::new(move |_| {
            // would deadlock if the lock were held
            assert_eq!(h.state(), SockCmState::Connected);
        })))
        .unwrap();
        handle.on_connected();
    }

    #[test]
    fn failure_is_deferred_to_progress() {
        let (mut ep, handle) = SockCmEp::connect(&mut PairConnector, peer()).unwrap();
        let failed = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failed);
        ep.flush_nb(Some(Box::new(move |res: Result<()>| {
            assert!(matches!(res, Err(TcpAmError::Unreachable)));
            f.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        let reported = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reported);
        ep.set_err_handler(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let h = handle.clone();
        std::thread::spawn(move || h.set_failed(TcpAmError::Unreachable))
            .join()
            .unwrap();
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        assert_eq!(ep.state(), SockCmState::SockConnecting);

        assert_eq!(ep.progress(), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(ep.state(), SockCmState::Closed);
        assert!(matches!(ep.flush(), Err(TcpAmError::Unreachable)));
        assert!(!handle.on_connected());

        handle.set_failed(TcpAmError::Unreachable);
        assert_eq!(ep.progress(), 0);
    }

    #[test]
    fn data_path_is_unsupported() {
        let (mut ep, _handle) = SockCmEp::connect(&mut PairConnector, peer()).unwrap();
        assert!(matches!(ep.am_short(0, 0, &[]), Err(TcpAmError::Unsupported)));
        assert!(matches!(
            ep.am_zcopy(0, &[], &[], None),
            Err(TcpAmError::Unsupported)
        ));
    }

    #[test]
    fn connect_error_is_reported() {
        let err = SockCmEp::connect(&mut RefusingConnector, peer()).err().unwrap();
        assert!(matches!(err, TcpAmError::Io(_)));
    }
}

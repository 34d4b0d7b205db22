//! Shared mocks for the integration tests: a scripted byte stream, an event
//! set that checks registration consistency, a recording connection manager
//! and a connector handing out mock sockets.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tcpam::{
    CmEvent, ConnManager, ConnState, Connector, EpId, EventSet, Events, Frame, IfaceConfig,
    IfaceResources, PacketOutcome, Socket, TcpAmError, TcpEp, TcpIface,
};

static NEXT_FD: AtomicI32 = AtomicI32::new(1000);

#[derive(Default)]
pub struct Wire {
    pub written: Vec<u8>,
    /// Bytes accepted per write call; `None` is unlimited.
    pub write_limit: Option<usize>,
    /// Per-call acceptance consumed before `write_limit` applies.
    pub write_budget: VecDeque<usize>,
    pub blocked: bool,
    pub write_error: Option<io::ErrorKind>,
    pub write_calls: usize,
    pub inbound: VecDeque<Vec<u8>>,
    pub eof: bool,
    pub read_error: Option<io::ErrorKind>,
}

/// In-memory non-blocking stream. Clones share the same wire.
#[derive(Clone)]
pub struct MockSocket {
    wire: Arc<Mutex<Wire>>,
    fd: RawFd,
}

impl MockSocket {
    pub fn new() -> Self {
        Self {
            wire: Arc::new(Mutex::new(Wire::default())),
            fd: NEXT_FD.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn written(&self) -> Vec<u8> {
        self.wire.lock().written.clone()
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.wire.lock().write_limit = limit;
    }

    pub fn push_write_budget(&self, budget: usize) {
        self.wire.lock().write_budget.push_back(budget);
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.wire.lock().blocked = blocked;
    }

    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.wire.lock().write_error = Some(kind);
    }

    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.wire.lock().read_error = Some(kind);
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.wire.lock().inbound.push_back(bytes.to_vec());
    }

    pub fn has_inbound(&self) -> bool {
        !self.wire.lock().inbound.is_empty()
    }

    pub fn close_inbound(&self) {
        self.wire.lock().eof = true;
    }
}

impl Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.wire.lock();
        let wire = &mut *guard;
        if let Some(kind) = wire.read_error.take() {
            return Err(kind.into());
        }
        let Some(chunk) = wire.inbound.front_mut() else {
            return if wire.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            wire.inbound.pop_front();
        }
        Ok(n)
    }
}

impl Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_vectored(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut guard = self.wire.lock();
        let wire = &mut *guard;
        wire.write_calls += 1;
        if let Some(kind) = wire.write_error {
            return Err(kind.into());
        }
        if wire.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut limit = wire
            .write_budget
            .pop_front()
            .or(wire.write_limit)
            .unwrap_or(usize::MAX);
        if limit == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut accepted = 0;
        for buf in bufs {
            let take = buf.len().min(limit);
            wire.written.extend_from_slice(&buf[..take]);
            accepted += take;
            limit -= take;
            if limit == 0 {
                break;
            }
        }
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for MockSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[derive(Default)]
pub struct EventLog {
    pub interest: HashMap<RawFd, (Events, EpId)>,
    pub calls: usize,
    pub fail: bool,
    pub ready: VecDeque<Vec<(EpId, Events)>>,
}

/// Event set that rejects inconsistent registrations.
#[derive(Clone, Default)]
pub struct MockEventSet {
    pub log: Arc<Mutex<EventLog>>,
}

impl MockEventSet {
    pub fn interest(&self, fd: RawFd) -> Events {
        self.log
            .lock()
            .interest
            .get(&fd)
            .map_or(Events::NONE, |(events, _)| *events)
    }

    pub fn calls(&self) -> usize {
        self.log.lock().calls
    }

    pub fn registered(&self) -> usize {
        self.log.lock().interest.len()
    }

    pub fn set_fail(&self, fail: bool) {
        self.log.lock().fail = fail;
    }

    pub fn push_ready(&self, batch: Vec<(EpId, Events)>) {
        self.log.lock().ready.push_back(batch);
    }

    fn check(log: &mut EventLog, events: Events) -> io::Result<()> {
        log.calls += 1;
        if log.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "event set failure"));
        }
        if events.is_empty() {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(())
    }
}

impl EventSet for MockEventSet {
    fn add(&mut self, fd: RawFd, events: Events, token: EpId) -> io::Result<()> {
        let mut log = self.log.lock();
        Self::check(&mut log, events)?;
        if log.interest.contains_key(&fd) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        log.interest.insert(fd, (events, token));
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, events: Events, token: EpId) -> io::Result<()> {
        let mut log = self.log.lock();
        Self::check(&mut log, events)?;
        match log.interest.get_mut(&fd) {
            Some(entry) => {
                *entry = (events, token);
                Ok(())
            }
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let mut log = self.log.lock();
        Self::check(&mut log, Events::ALL)?;
        log.interest
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn wait(
        &mut self,
        _timeout: Option<Duration>,
        out: &mut Vec<(EpId, Events)>,
    ) -> io::Result<()> {
        if let Some(batch) = self.log.lock().ready.pop_front() {
            out.extend(batch);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CmLog {
    pub events: Vec<(EpId, CmEvent)>,
    pub packets: Vec<(EpId, Vec<u8>)>,
    pub fail_send_event: bool,
    pub fail_conn_start: bool,
}

/// Connection manager that connects on the first writable event and
/// records everything else.
#[derive(Clone, Default)]
pub struct MockCm {
    pub log: Arc<Mutex<CmLog>>,
}

impl ConnManager for MockCm {
    fn conn_start(&mut self, ep: &mut TcpEp, res: &mut IfaceResources) -> tcpam::Result<()> {
        if self.log.lock().fail_conn_start {
            return Err(TcpAmError::Unreachable);
        }
        ep.set_conn_state(res, ConnState::Connecting);
        Ok(())
    }

    fn conn_progress(&mut self, ep: &mut TcpEp, res: &mut IfaceResources) -> usize {
        ep.set_conn_state(res, ConnState::Connected);
        1
    }

    fn send_event(
        &mut self,
        ep: &mut TcpEp,
        _res: &mut IfaceResources,
        event: CmEvent,
    ) -> tcpam::Result<()> {
        let mut log = self.log.lock();
        if log.fail_send_event {
            return Err(TcpAmError::Unreachable);
        }
        log.events.push((ep.id(), event));
        Ok(())
    }

    fn handle_conn_pkt(
        &mut self,
        ep: &mut TcpEp,
        _res: &mut IfaceResources,
        payload: &[u8],
    ) -> PacketOutcome {
        self.log.lock().packets.push((ep.id(), payload.to_vec()));
        if payload == b"destroy" {
            PacketOutcome::DestroyEndpoint
        } else {
            PacketOutcome::Handled(0)
        }
    }
}

/// Hands out [`MockSocket`]s and keeps a clone of each.
#[derive(Clone, Default)]
pub struct MockConnector {
    pub sockets: Arc<Mutex<Vec<(SocketAddr, MockSocket)>>>,
    pub refuse: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn last(&self) -> Option<MockSocket> {
        self.sockets.lock().last().map(|(_, sock)| sock.clone())
    }

    pub fn count(&self) -> usize {
        self.sockets.lock().len()
    }
}

impl Connector for MockConnector {
    fn connect(&mut self, peer: SocketAddr) -> io::Result<Box<dyn Socket>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let sock = MockSocket::new();
        self.sockets.lock().push((peer, sock.clone()));
        Ok(Box::new(sock))
    }
}

pub struct Harness {
    pub iface: TcpIface,
    pub events: MockEventSet,
    pub cm: MockCm,
    pub connector: MockConnector,
}

pub fn ifaddr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

pub fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], port))
}

pub fn harness() -> Harness {
    harness_with(IfaceConfig::default())
}

pub fn harness_with(config: IfaceConfig) -> Harness {
    let events = MockEventSet::default();
    let cm = MockCm::default();
    let connector = MockConnector::default();
    let iface = TcpIface::new(
        ifaddr(),
        config,
        Box::new(events.clone()),
        Box::new(cm.clone()),
        Box::new(connector.clone()),
    )
    .unwrap();
    Harness {
        iface,
        events,
        cm,
        connector,
    }
}

/// Create a TX endpoint to `peer` and drive it to CONNECTED.
pub fn connected_ep(h: &mut Harness, peer: SocketAddr) -> (EpId, MockSocket) {
    let id = h.iface.ep_create(peer).unwrap();
    let sock = h.connector.last().unwrap();
    assert_eq!(h.iface.progress_tx(id), 1);
    assert_eq!(h.iface.ep_ref(id).unwrap().conn_state(), ConnState::Connected);
    (id, sock)
}

/// Accept an inbound socket from `peer` and walk it to CONNECTED with RX.
pub fn accepted_ep(h: &mut Harness, peer: SocketAddr) -> (EpId, MockSocket) {
    let sock = MockSocket::new();
    let id = h.iface.ep_accept(Box::new(sock.clone()), peer);
    h.iface.add_ctx_cap(id, tcpam::CtxType::Rx).unwrap();
    h.iface.set_conn_state(id, ConnState::Connected).unwrap();
    (id, sock)
}

pub fn frame(am_id: u8, payload: &[u8]) -> Vec<u8> {
    Frame::new(am_id, payload.to_vec()).encode().to_vec()
}

/// Wire image of a short send.
pub fn short_frame(am_id: u8, header: u64, payload: &[u8]) -> Vec<u8> {
    let mut body = header.to_ne_bytes().to_vec();
    body.extend_from_slice(payload);
    frame(am_id, &body)
}

pub type Received = Arc<Mutex<Vec<(u8, Vec<u8>)>>>;

/// Install a recording handler on every id in `ids`.
pub fn record_am(iface: &mut TcpIface, ids: impl IntoIterator<Item = u8>) -> Received {
    let received = Received::default();
    for am_id in ids {
        let sink = Arc::clone(&received);
        iface
            .set_am_handler(am_id, move |payload: &[u8]| {
                sink.lock().push((am_id, payload.to_vec()));
            })
            .unwrap();
    }
    received
}

/// Dispatch READ until the socket has nothing left to deliver.
pub fn drain_rx(iface: &mut TcpIface, id: EpId, sock: &MockSocket) -> usize {
    let mut handled = 0;
    for _ in 0..10_000 {
        if !sock.has_inbound() || iface.ep_ref(id).is_none() {
            break;
        }
        handled += iface.dispatch(id, Events::READ);
    }
    handled
}

//! TCP endpoint: one socket, its connection state and its per-direction
//! capabilities.
//!
//! The endpoint owns the socket and the tx/rx buffer contexts. Everything it
//! shares with the other endpoints of its interface (pools, event set,
//! connection index, handlers) arrives as an explicit `&mut IfaceResources`.

mod rx;
mod tx;

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::buffer::BufCtx;
use crate::caps::{CtxCaps, CtxType};
use crate::cm::ConnManager;
use crate::endpoint::{Completion, Endpoint, SendStatus};
use crate::error::{Result, TcpAmError};
use crate::events::Events;
use crate::iface::IfaceResources;
use crate::pending::{PendingOp, PendingQueue};
use crate::sock::Socket;
use crate::state::{ConnState, TxAction};
use crate::zcopy::ZcopyCtx;

/// Endpoint identifier, unique within an interface and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpId(pub usize);

impl fmt::Display for EpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct TcpEp {
    id: EpId,
    peer_addr: SocketAddr,
    socket: Option<Box<dyn Socket>>,
    fd: RawFd,
    conn_state: ConnState,
    caps: CtxCaps,
    events: Events,
    tx: BufCtx,
    rx: BufCtx,
    zcopy: Option<ZcopyCtx>,
    pending: PendingQueue,
    failed: bool,
}

impl TcpEp {
    pub(crate) fn new(id: EpId, socket: Box<dyn Socket>, peer_addr: SocketAddr) -> Self {
        let fd = socket.raw_fd();
        Self {
            id,
            peer_addr,
            socket: Some(socket),
            fd,
            conn_state: ConnState::Closed,
            caps: CtxCaps::NONE,
            events: Events::NONE,
            tx: BufCtx::new(),
            rx: BufCtx::new(),
            zcopy: None,
            pending: PendingQueue::new(),
            failed: false,
        }
    }

    pub fn id(&self) -> EpId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    pub fn caps(&self) -> CtxCaps {
        self.caps
    }

    /// Readiness interest currently registered with the event set.
    pub fn events(&self) -> Events {
        self.events
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffered (copy) bytes are waiting to be written.
    pub fn tx_in_progress(&self) -> bool {
        self.tx.need_progress() && !self.caps.has(CtxType::ZcopyTx)
    }

    /// A zero-copy frame is partially written.
    pub fn zcopy_in_progress(&self) -> bool {
        self.zcopy.is_some()
    }

    /// Peer address equals the interface address.
    pub fn is_self(&self, res: &IfaceResources) -> bool {
        self.peer_addr == res.ifaddr()
    }

    /// Replace the peer address, keeping the connection index in sync.
    pub fn set_peer_addr(&mut self, res: &mut IfaceResources, addr: SocketAddr) {
        if addr == self.peer_addr {
            return;
        }
        let indexed = !self.is_self(res) && res.index.contains(self.peer_addr, self.id);
        if indexed {
            res.index.remove(self.peer_addr, self.id);
        }
        debug!(ep = %self.id, from = %self.peer_addr, to = %addr, "peer address changed");
        self.peer_addr = addr;
        if indexed && !self.is_self(res) {
            res.index.add(self.peer_addr, self.id);
        }
    }

    /// Move to `new_state`, adjusting readiness interest. Entering CLOSED
    /// releases capabilities, buffers and the socket.
    pub fn set_conn_state(&mut self, res: &mut IfaceResources, new_state: ConnState) {
        let old_state = self.conn_state;
        if old_state == new_state {
            return;
        }
        self.conn_state = new_state;
        debug!(
            ep = %self.id,
            peer = %self.peer_addr,
            from = %old_state,
            to = %new_state,
            "connection state changed"
        );

        match new_state {
            ConnState::Closed => self.close(res),
            ConnState::Connecting => self.mod_events(res, Events::WRITE, Events::NONE),
            ConnState::WaitingAck | ConnState::Accepting | ConnState::WaitingReq => {
                self.mod_events(res, Events::READ, Events::NONE)
            }
            ConnState::Connected => {
                self.mod_events(res, Events::READ, Events::NONE);
                if self.tx.need_progress() || !self.pending.is_empty() {
                    self.mod_events(res, Events::WRITE, Events::NONE);
                } else {
                    self.mod_events(res, Events::NONE, Events::WRITE);
                }
            }
        }
    }

    fn close(&mut self, res: &mut IfaceResources) {
        self.remove_ctx_cap(res, CtxType::Tx);
        self.remove_ctx_cap(res, CtxType::Rx);
        if !self.pending.is_empty() {
            warn!(
                ep = %self.id,
                pending = self.pending.len(),
                "closing endpoint with pending operations"
            );
        }
        self.complete_zcopy(Err(TcpAmError::Unreachable));
        self.release_tx(res);
        self.rx.reset(&mut res.rx_pool);
        self.mod_events(res, Events::NONE, Events::ALL);
        if self.socket.take().is_some() {
            trace!(ep = %self.id, fd = self.fd, "socket closed");
        }
    }

    /// Add `add` and drop `remove` from the readiness interest.
    ///
    /// # Panics
    ///
    /// If the event set rejects the change: the interest bookkeeping is
    /// broken and no further progress can be trusted.
    pub fn mod_events(&mut self, res: &mut IfaceResources, add: Events, remove: Events) {
        let old = self.events;
        let new = (old | add).difference(remove);
        if new == old {
            return;
        }
        self.events = new;
        trace!(ep = %self.id, fd = self.fd, from = %old, to = %new, "set events");

        let status = if new.is_empty() {
            res.event_set.remove(self.fd)
        } else if old.is_empty() {
            res.event_set.add(self.fd, new, self.id)
        } else {
            res.event_set.modify(self.fd, new, self.id)
        };
        if let Err(err) = status {
            error!(ep = %self.id, fd = self.fd, "unable to modify event set: {err}");
            panic!(
                "tcp_ep {}: unable to set events {} on fd {}: {}",
                self.id, new, self.fd, err
            );
        }
    }

    fn set_caps(&mut self, caps: CtxCaps) {
        if caps != self.caps {
            trace!(ep = %self.id, from = %self.caps, to = %caps, "ctx caps changed");
            self.caps = caps;
        }
    }

    /// Grant a direction. Fails once the endpoint has lost its socket.
    pub fn add_ctx_cap(&mut self, res: &mut IfaceResources, cap: CtxType) -> Result<()> {
        debug_assert!(cap != CtxType::ZcopyTx);
        if self.socket.is_none() {
            return Err(TcpAmError::Unreachable);
        }
        let prev = self.caps;
        self.set_caps(prev.with(cap));
        if !self.is_self(res) && prev != self.caps {
            if prev.directions().is_empty() {
                res.index.add(self.peer_addr, self.id);
            } else if self.caps.is_duplex() {
                res.index.remove(self.peer_addr, self.id);
            }
        }
        Ok(())
    }

    /// Revoke a direction.
    pub fn remove_ctx_cap(&mut self, res: &mut IfaceResources, cap: CtxType) {
        debug_assert!(cap != CtxType::ZcopyTx);
        let prev = self.caps;
        self.set_caps(prev.without(cap));
        if self.is_self(res) || prev == self.caps {
            return;
        }
        if prev.is_duplex() {
            res.index.add(self.peer_addr, self.id);
        } else if self.caps.directions().is_empty() {
            res.index.remove(self.peer_addr, self.id);
        }
    }

    /// Admission check shared by all send paths.
    pub(crate) fn check_tx_res(&self) -> Result<()> {
        self.conn_state.tx_admission()?;
        if self.tx.is_empty() {
            Ok(())
        } else {
            Err(TcpAmError::NoResource)
        }
    }

    /// Write readiness: run the action of the current state.
    pub(crate) fn progress_tx(
        &mut self,
        res: &mut IfaceResources,
        cm: &mut dyn ConnManager,
    ) -> usize {
        match self.conn_state.tx_action() {
            TxAction::Data => self.progress_data_tx(res),
            TxAction::ConnProgress => cm.conn_progress(self, res),
            TxAction::Idle => self.progress_ctrl_tx(res),
        }
    }

    pub(crate) fn flush(&self) -> Result<()> {
        match self.check_tx_res() {
            Err(TcpAmError::NoResource) => Err(TcpAmError::NoResource),
            _ => Ok(()),
        }
    }

    pub(crate) fn pending_add(&mut self, op: Box<dyn PendingOp>) -> Result<()> {
        if self.check_tx_res().is_ok() {
            return Err(TcpAmError::Busy);
        }
        self.pending.push_back(op);
        trace!(ep = %self.id, pending = self.pending.len(), "added pending operation");
        Ok(())
    }

    pub(crate) fn pending_purge(&mut self, cb: &mut dyn FnMut(Box<dyn PendingOp>)) {
        let purged = self.pending.purge(cb);
        if purged > 0 {
            debug!(ep = %self.id, purged, "purged pending operations");
        }
    }

    fn complete_zcopy(&mut self, status: Result<()>) {
        if let Some(ctx) = self.zcopy.take() {
            self.caps = self.caps.without(CtxType::ZcopyTx);
            ctx.complete(status);
        }
    }

    /// Force CLOSED after a hard error. Returns `false` if already failed.
    pub(crate) fn set_failed(&mut self, res: &mut IfaceResources) -> bool {
        if self.failed {
            return false;
        }
        self.failed = true;
        debug!(ep = %self.id, state = %self.conn_state, "endpoint failed");
        self.set_conn_state(res, ConnState::Closed);
        true
    }

    /// Release everything before the endpoint is dropped.
    pub(crate) fn teardown(&mut self, res: &mut IfaceResources) {
        self.complete_zcopy(Err(TcpAmError::Canceled));
        if self.conn_state != ConnState::Closed {
            self.set_conn_state(res, ConnState::Closed);
        } else {
            self.close(res);
        }
    }
}

impl fmt::Debug for TcpEp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpEp")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("fd", &self.fd)
            .field("conn_state", &self.conn_state)
            .field("caps", &self.caps)
            .field("events", &self.events)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A TCP endpoint together with its interface resources, usable through the
/// [`Endpoint`] trait.
pub struct EpHandle<'a> {
    ep: &'a mut TcpEp,
    res: &'a mut IfaceResources,
}

impl<'a> EpHandle<'a> {
    pub(crate) fn new(ep: &'a mut TcpEp, res: &'a mut IfaceResources) -> Self {
        Self { ep, res }
    }

    pub fn ep(&self) -> &TcpEp {
        self.ep
    }

    pub fn id(&self) -> EpId {
        self.ep.id
    }
}

impl Endpoint for EpHandle<'_> {
    fn am_short(&mut self, am_id: u8, header: u64, payload: &[u8]) -> Result<()> {
        self.ep.am_short(self.res, am_id, header, payload)
    }

    fn am_bcopy(
        &mut self,
        am_id: u8,
        pack: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<usize> {
        self.ep.am_bcopy(self.res, am_id, pack)
    }

    fn am_zcopy(
        &mut self,
        am_id: u8,
        header: &[u8],
        iov: &[Bytes],
        comp: Option<Completion>,
    ) -> Result<SendStatus> {
        self.ep.am_zcopy(self.res, am_id, header, iov, comp)
    }

    fn pending_add(&mut self, op: Box<dyn PendingOp>) -> Result<()> {
        self.ep.pending_add(op)
    }

    fn pending_purge(&mut self, cb: &mut dyn FnMut(Box<dyn PendingOp>)) {
        self.ep.pending_purge(cb)
    }

    fn flush(&mut self) -> Result<()> {
        self.ep.flush()
    }
}

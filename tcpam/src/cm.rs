//! Connection-management collaborator.
//!
//! The endpoint engine owns framing and data transfer; the handshake that
//! decides which socket serves which direction belongs to a [`ConnManager`].
//! Control packets travel as frames with id [`crate::frame::CTRL_AM_ID`].
//!
//! [`ConnIndex`] is the per-interface lookup of endpoints that serve a single
//! direction for a peer, maintained by the capability transitions.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::caps::CtxType;
use crate::ep::{EpId, TcpEp};
use crate::error::{Result, TcpAmError};
use crate::iface::IfaceResources;
use crate::state::ConnState;

/// Control events exchanged by connection managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmEvent {
    /// Ask the peer to serve RX for this socket.
    ConnReq = 0x01,
    /// Acknowledge a connection request.
    ConnAck = 0x02,
}

impl TryFrom<u8> for CmEvent {
    type Error = TcpAmError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(CmEvent::ConnReq),
            0x02 => Ok(CmEvent::ConnAck),
            other => Err(TcpAmError::UnknownControlEvent(other)),
        }
    }
}

/// What the connection manager did with a control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Packet consumed; the count is additional progress made.
    Handled(usize),
    /// The endpoint must be destroyed; the receive loop stops at once.
    DestroyEndpoint,
}

/// Handshake protocol driven by the endpoint engine.
pub trait ConnManager: Send {
    /// Start the handshake on a freshly connected outbound endpoint.
    fn conn_start(&mut self, ep: &mut TcpEp, res: &mut IfaceResources) -> Result<()>;

    /// Write readiness while the endpoint is CONNECTING.
    fn conn_progress(&mut self, ep: &mut TcpEp, res: &mut IfaceResources) -> usize;

    /// Send a control event to the endpoint's peer.
    fn send_event(&mut self, ep: &mut TcpEp, res: &mut IfaceResources, event: CmEvent)
        -> Result<()>;

    /// A control frame arrived on `ep`.
    fn handle_conn_pkt(
        &mut self,
        ep: &mut TcpEp,
        res: &mut IfaceResources,
        payload: &[u8],
    ) -> PacketOutcome;
}

/// Endpoints serving a single direction, by peer address.
#[derive(Debug, Default)]
pub struct ConnIndex {
    by_peer: HashMap<SocketAddr, Vec<EpId>>,
}

impl ConnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` under `peer`. Registering twice is a no-op.
    pub fn add(&mut self, peer: SocketAddr, id: EpId) {
        let list = self.by_peer.entry(peer).or_default();
        if !list.contains(&id) {
            list.push(id);
            trace!(ep = %id, %peer, "added to connection index");
        }
    }

    pub fn remove(&mut self, peer: SocketAddr, id: EpId) {
        if let Some(list) = self.by_peer.get_mut(&peer) {
            list.retain(|other| *other != id);
            if list.is_empty() {
                self.by_peer.remove(&peer);
            }
            trace!(ep = %id, %peer, "removed from connection index");
        }
    }

    pub fn contains(&self, peer: SocketAddr, id: EpId) -> bool {
        self.by_peer
            .get(&peer)
            .is_some_and(|list| list.contains(&id))
    }

    /// Registered endpoints for `peer`, oldest first.
    pub fn candidates(&self, peer: SocketAddr) -> impl Iterator<Item = EpId> + '_ {
        self.by_peer.get(&peer).into_iter().flatten().copied()
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.by_peer.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}

/// Minimal request/acknowledge handshake.
///
/// The connecting side sends `ConnReq` carrying its interface address once
/// the socket is writable and waits for `ConnAck`. The accepting side adopts
/// that address as the endpoint's peer, takes RX and answers with `ConnAck`.
/// A `ConnReq` on an already connected endpoint grants it RX as well.
#[derive(Debug, Default)]
pub struct HandshakeCm;

impl HandshakeCm {
    pub fn new() -> Self {
        Self
    }

    fn encode(event: CmEvent, ifaddr: SocketAddr) -> BytesMut {
        let addr = ifaddr.to_string();
        let mut buf = BytesMut::with_capacity(1 + addr.len());
        buf.put_u8(event as u8);
        buf.put_slice(addr.as_bytes());
        buf
    }

    fn decode(mut payload: &[u8]) -> Option<(CmEvent, Option<SocketAddr>)> {
        if !payload.has_remaining() {
            return None;
        }
        let event = CmEvent::try_from(payload.get_u8()).ok()?;
        let addr = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse().ok());
        Some((event, addr))
    }
}

impl ConnManager for HandshakeCm {
    fn conn_start(&mut self, ep: &mut TcpEp, res: &mut IfaceResources) -> Result<()> {
        ep.set_conn_state(res, ConnState::Connecting);
        Ok(())
    }

    fn conn_progress(&mut self, ep: &mut TcpEp, res: &mut IfaceResources) -> usize {
        match self.send_event(ep, res, CmEvent::ConnReq) {
            Ok(()) => {
                ep.set_conn_state(res, ConnState::WaitingAck);
                1
            }
            Err(TcpAmError::NoResource) => 0,
            Err(err) => {
                warn!(ep = %ep.id(), peer = %ep.peer_addr(), "connection request failed: {err}");
                res.schedule_failure(ep.id());
                0
            }
        }
    }

    fn send_event(
        &mut self,
        ep: &mut TcpEp,
        res: &mut IfaceResources,
        event: CmEvent,
    ) -> Result<()> {
        let pkt = Self::encode(event, res.ifaddr());
        debug!(ep = %ep.id(), ?event, "sending connection event");
        ep.send_ctrl(res, &pkt)
    }

    fn handle_conn_pkt(
        &mut self,
        ep: &mut TcpEp,
        res: &mut IfaceResources,
        payload: &[u8],
    ) -> PacketOutcome {
        let Some((event, addr)) = Self::decode(payload) else {
            warn!(ep = %ep.id(), len = payload.len(), "malformed connection packet");
            return PacketOutcome::DestroyEndpoint;
        };
        debug!(ep = %ep.id(), ?event, state = %ep.conn_state(), "received connection event");

        match (event, ep.conn_state()) {
            (CmEvent::ConnReq, ConnState::Accepting | ConnState::WaitingReq) => {
                if let Some(addr) = addr {
                    ep.set_peer_addr(res, addr);
                }
                if ep.add_ctx_cap(res, CtxType::Rx).is_err() {
                    return PacketOutcome::DestroyEndpoint;
                }
                ep.set_conn_state(res, ConnState::Connected);
                if let Err(err) = self.send_event(ep, res, CmEvent::ConnAck) {
                    warn!(ep = %ep.id(), "unable to acknowledge connection: {err}");
                }
                PacketOutcome::Handled(1)
            }
            (CmEvent::ConnReq, ConnState::Connected) => match ep.add_ctx_cap(res, CtxType::Rx) {
                Ok(()) => PacketOutcome::Handled(1),
                Err(_) => PacketOutcome::DestroyEndpoint,
            },
            (CmEvent::ConnAck, ConnState::WaitingAck) => {
                ep.set_conn_state(res, ConnState::Connected);
                PacketOutcome::Handled(1)
            }
            (event, state) => {
                warn!(ep = %ep.id(), ?event, %state, "unexpected connection event");
                PacketOutcome::Handled(0)
            }
        }
    }
}

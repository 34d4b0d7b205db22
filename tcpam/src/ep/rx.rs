//! Receive path: reassembly of partially delivered frames and demultiplexing
//! to active-message handlers or the connection manager.

use std::io;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use super::TcpEp;
use crate::caps::{CtxCaps, CtxType};
use crate::cm::{ConnManager, PacketOutcome};
use crate::events::Events;
use crate::frame::{AmHeader, HEADER_LEN};
use crate::iface::IfaceResources;
use crate::sock::{recv_nb, RecvStatus};
use crate::state::ConnState;

/// Result of one receive progress call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RxOutcome {
    pub handled: usize,
    /// The endpoint must be destroyed by its interface.
    pub destroy: bool,
}

impl RxOutcome {
    fn handled(handled: usize) -> Self {
        Self {
            handled,
            destroy: false,
        }
    }
}

enum RecvResult {
    Data,
    NoData,
    Disconnected,
}

/// Outcome of one read and the demultiplexing that follows it.
enum RxPass {
    /// Data was consumed; the socket may hold more.
    More(usize),
    Done(RxOutcome),
}

impl TcpEp {
    /// Read readiness. Readiness is edge-triggered, so read and dispatch
    /// until the socket has nothing more to give.
    pub(crate) fn progress_rx(
        &mut self,
        res: &mut IfaceResources,
        cm: &mut dyn ConnManager,
    ) -> RxOutcome {
        let mut handled = 0;
        loop {
            match self.rx_pass(res, cm) {
                RxPass::More(count) => {
                    handled += count;
                    // closed or unsubscribed by the connection manager
                    if self.socket.is_none() || !self.events.contains(Events::READ) {
                        return RxOutcome::handled(handled);
                    }
                }
                RxPass::Done(mut outcome) => {
                    outcome.handled += handled;
                    return outcome;
                }
            }
        }
    }

    fn rx_pass(&mut self, res: &mut IfaceResources, cm: &mut dyn ConnManager) -> RxPass {
        let seg_size = res.rx_pool.buf_size();

        let recv_length = if !self.rx.need_progress() {
            if self.rx.handle().is_none() {
                let Some(handle) = res.rx_pool.get() else {
                    warn!(ep = %self.id, pool = res.rx_pool.name(), "unable to get a receive buffer");
                    return RxPass::Done(RxOutcome::default());
                };
                self.rx.attach(handle);
            }
            seg_size - self.rx.length
        } else if self.rx.remaining() < HEADER_LEN {
            // rest of the header and as much as fits after it
            seg_size - self.rx.length
        } else {
            let Some(handle) = self.rx.handle() else {
                return RxPass::Done(RxOutcome::default());
            };
            match AmHeader::decode(&res.rx_pool.buf(handle)[self.rx.offset..self.rx.length]) {
                Ok(hdr) => hdr.frame_len() - self.rx.remaining(),
                Err(_) => return RxPass::Done(RxOutcome::default()),
            }
        };

        match self.recv(res, recv_length) {
            RecvResult::Data => {}
            RecvResult::NoData => return RxPass::Done(RxOutcome::default()),
            RecvResult::Disconnected => return RxPass::Done(self.handle_disconnected(res)),
        }

        let frame_max = res.limits.frame_max;
        let mut handled = 0;
        while self.rx.need_progress() {
            let Some(handle) = self.rx.handle() else {
                break;
            };
            let remainder = self.rx.remaining();
            if remainder < HEADER_LEN {
                self.rx_keep_partial(res);
                return RxPass::More(handled + 1);
            }

            let offset = self.rx.offset;
            let hdr = match AmHeader::decode(&res.rx_pool.buf(handle)[offset..self.rx.length]) {
                Ok(hdr) => hdr,
                Err(_) => break,
            };
            if hdr.length as usize > frame_max {
                error!(
                    ep = %self.id,
                    am_id = hdr.am_id,
                    len = hdr.length,
                    max = frame_max,
                    "received frame exceeds the receive segment"
                );
                let mut outcome = self.handle_disconnected(res);
                outcome.handled += handled;
                return RxPass::Done(outcome);
            }
            if remainder < hdr.frame_len() {
                self.rx_keep_partial(res);
                return RxPass::More(handled + 1);
            }

            self.rx.offset += hdr.frame_len();
            let payload = offset + HEADER_LEN..offset + hdr.frame_len();

            if !hdr.is_control() {
                trace!(
                    ep = %self.id,
                    am_id = hdr.am_id,
                    len = hdr.length,
                    offset = self.rx.offset,
                    length = self.rx.length,
                    "am recv"
                );
                let data = &res.rx_pool.buf(handle)[payload];
                res.am_handlers.invoke(self.id, hdr.am_id, data);
                handled += 1;
            } else {
                let data = Bytes::copy_from_slice(&res.rx_pool.buf(handle)[payload]);
                match cm.handle_conn_pkt(self, res, &data) {
                    PacketOutcome::Handled(extra) => handled += 1 + extra,
                    PacketOutcome::DestroyEndpoint => {
                        return RxPass::Done(RxOutcome {
                            handled: handled + 1,
                            destroy: true,
                        });
                    }
                }
            }
        }

        self.rx.reset(&mut res.rx_pool);
        RxPass::More(handled)
    }

    /// Move the unconsumed partial frame to the front of the buffer.
    fn rx_keep_partial(&mut self, res: &mut IfaceResources) {
        let Some(handle) = self.rx.handle() else {
            return;
        };
        let (offset, length) = (self.rx.offset, self.rx.length);
        if offset > 0 {
            res.rx_pool.buf_mut(handle).copy_within(offset..length, 0);
        }
        self.rx.offset = 0;
        self.rx.length = length - offset;
    }

    fn recv(&mut self, res: &mut IfaceResources, len: usize) -> RecvResult {
        debug_assert!(len > 0);
        let Some(handle) = self.rx.handle() else {
            return RecvResult::NoData;
        };
        let Some(sock) = self.socket.as_mut() else {
            return RecvResult::Disconnected;
        };
        let start = self.rx.length;
        let dst = &mut res.rx_pool.buf_mut(handle)[start..start + len];

        match recv_nb(sock.as_mut(), dst) {
            RecvStatus::Data(n) => {
                self.rx.length += n;
                trace!(ep = %self.id, fd = self.fd, received = n, "recv");
                RecvResult::Data
            }
            RecvStatus::NoData => {
                // nothing landed in a fresh buffer, give it back
                if self.rx.length == 0 {
                    self.rx.reset(&mut res.rx_pool);
                }
                RecvResult::NoData
            }
            RecvStatus::Closed => {
                debug!(ep = %self.id, peer = %self.peer_addr, "connection closed by peer");
                RecvResult::Disconnected
            }
            RecvStatus::Failed(err) => {
                if self.is_benign_reset(&err) {
                    debug!(
                        ep = %self.id,
                        local = %res.ifaddr(),
                        peer = %self.peer_addr,
                        "connection was dropped by the peer: {err}"
                    );
                } else {
                    warn!(ep = %self.id, peer = %self.peer_addr, fd = self.fd, "recv failed: {err}");
                }
                RecvResult::Disconnected
            }
        }
    }

    fn is_benign_reset(&self, err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::ConnectionReset
            && self.conn_state == ConnState::Connected
            && self.caps == CtxCaps::RX
    }

    /// The peer is gone for reading. RX-only endpoints are to be destroyed,
    /// duplex ones keep TX.
    fn handle_disconnected(&mut self, res: &mut IfaceResources) -> RxOutcome {
        debug!(ep = %self.id, caps = %self.caps, "remote disconnected");
        self.mod_events(res, Events::NONE, Events::READ);
        self.rx.reset(&mut res.rx_pool);

        if self.caps.has(CtxType::Rx) {
            if self.caps.has(CtxType::Tx) {
                self.remove_ctx_cap(res, CtxType::Rx);
                return RxOutcome::default();
            }
            return RxOutcome {
                handled: 0,
                destroy: true,
            };
        }
        // handshake never completed
        RxOutcome {
            handled: 0,
            destroy: self.caps.directions().is_empty(),
        }
    }
}

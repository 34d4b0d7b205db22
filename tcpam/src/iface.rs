//! TCP interface: owner of the endpoints and of everything they share.
//!
//! The interface is driven explicitly. Readiness reported by the event set
//! goes to [`TcpIface::dispatch`] (or [`TcpIface::poll`], which waits and
//! dispatches), and deferred endpoint failures are handled by
//! [`TcpIface::progress`] on the owning thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::buffer::BufferPool;
use crate::caps::CtxType;
use crate::cm::{CmEvent, ConnIndex, ConnManager};
use crate::config::{IfaceConfig, SendLimits};
use crate::deferred::DeferredQueue;
use crate::ep::{EpHandle, EpId, TcpEp};
use crate::error::{Result, TcpAmError};
use crate::events::{EventSet, Events};
use crate::frame::AM_ID_MAX;
use crate::sock::{Connector, Socket};
use crate::state::ConnState;

/// Active-message handler: receives the frame payload.
pub type AmHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Called from [`TcpIface::progress`] when an endpoint has failed.
pub type ErrHandler = Box<dyn FnMut(EpId, &TcpAmError) + Send>;

/// Handle for reporting endpoint failures from any thread.
pub type FailureNotifier = DeferredQueue<EpId>;

pub(crate) struct AmHandlerTable {
    handlers: Vec<Option<AmHandler>>,
}

impl AmHandlerTable {
    fn new() -> Self {
        Self {
            handlers: (0..AM_ID_MAX).map(|_| None).collect(),
        }
    }

    fn set(&mut self, am_id: u8, handler: Option<AmHandler>) -> Result<()> {
        let slot = self
            .handlers
            .get_mut(am_id as usize)
            .ok_or(TcpAmError::InvalidAmId(am_id))?;
        *slot = handler;
        Ok(())
    }

    pub(crate) fn invoke(&mut self, ep: EpId, am_id: u8, payload: &[u8]) {
        match self.handlers.get_mut(am_id as usize) {
            Some(Some(handler)) => handler(payload),
            _ => warn!(ep = %ep, am_id, len = payload.len(), "active message was not handled"),
        }
    }
}

/// State shared by all endpoints of one interface.
pub struct IfaceResources {
    ifaddr: SocketAddr,
    pub(crate) config: IfaceConfig,
    pub(crate) limits: SendLimits,
    pub(crate) tx_pool: BufferPool,
    pub(crate) rx_pool: BufferPool,
    pub(crate) event_set: Box<dyn EventSet>,
    pub(crate) index: ConnIndex,
    pub(crate) am_handlers: AmHandlerTable,
    /// Bytes admitted for sending and not yet written to a socket.
    pub(crate) outstanding: usize,
    failures: FailureNotifier,
}

impl IfaceResources {
    pub fn ifaddr(&self) -> SocketAddr {
        self.ifaddr
    }

    pub fn config(&self) -> &IfaceConfig {
        &self.config
    }

    pub fn limits(&self) -> SendLimits {
        self.limits
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn index(&self) -> &ConnIndex {
        &self.index
    }

    pub fn tx_buffers_in_use(&self) -> usize {
        self.tx_pool.in_use()
    }

    pub fn rx_buffers_in_use(&self) -> usize {
        self.rx_pool.in_use()
    }

    /// Mark `id` failed; handled by the next [`TcpIface::progress`].
    pub fn schedule_failure(&self, id: EpId) {
        trace!(ep = %id, "endpoint failure scheduled");
        self.failures.push(id);
    }
}

pub struct TcpIface {
    res: IfaceResources,
    eps: HashMap<EpId, TcpEp>,
    next_id: usize,
    cm: Box<dyn ConnManager>,
    connector: Box<dyn Connector>,
    err_handler: Option<ErrHandler>,
    ready: Vec<(EpId, Events)>,
}

impl TcpIface {
    /// Create an interface listening on `ifaddr`. Accepting connections is
    /// the caller's business; accepted sockets enter through
    /// [`TcpIface::ep_accept`].
    pub fn new(
        ifaddr: SocketAddr,
        config: IfaceConfig,
        event_set: Box<dyn EventSet>,
        cm: Box<dyn ConnManager>,
        connector: Box<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let limits = config.limits();
        debug!(
            %ifaddr,
            tx_seg_size = config.tx_seg_size,
            rx_seg_size = config.rx_seg_size,
            zcopy_max_iov = limits.zcopy_max_iov,
            "tcp interface created"
        );
        let res = IfaceResources {
            ifaddr,
            tx_pool: BufferPool::new("tcp_tx", config.tx_pool_size, config.tx_seg_size),
            rx_pool: BufferPool::new("tcp_rx", config.rx_pool_size, config.rx_seg_size),
            limits,
            config,
            event_set,
            index: ConnIndex::new(),
            am_handlers: AmHandlerTable::new(),
            outstanding: 0,
            failures: FailureNotifier::new(),
        };
        Ok(Self {
            res,
            eps: HashMap::new(),
            next_id: 0,
            cm,
            connector,
            err_handler: None,
            ready: Vec::new(),
        })
    }

    pub fn resources(&self) -> &IfaceResources {
        &self.res
    }

    pub fn ifaddr(&self) -> SocketAddr {
        self.res.ifaddr
    }

    pub fn outstanding(&self) -> usize {
        self.res.outstanding
    }

    pub fn set_am_handler<F>(&mut self, am_id: u8, handler: F) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.res.am_handlers.set(am_id, Some(Box::new(handler)))
    }

    pub fn clear_am_handler(&mut self, am_id: u8) -> Result<()> {
        self.res.am_handlers.set(am_id, None)
    }

    pub fn set_err_handler<F>(&mut self, handler: F)
    where
        F: FnMut(EpId, &TcpAmError) + Send + 'static,
    {
        self.err_handler = Some(Box::new(handler));
    }

    /// Cloneable handle for reporting endpoint failures from other threads.
    pub fn failure_notifier(&self) -> FailureNotifier {
        self.res.failures.clone()
    }

    /// The endpoint as an [`crate::Endpoint`].
    pub fn ep(&mut self, id: EpId) -> Option<EpHandle<'_>> {
        let ep = self.eps.get_mut(&id)?;
        Some(EpHandle::new(ep, &mut self.res))
    }

    pub fn ep_ref(&self, id: EpId) -> Option<&TcpEp> {
        self.eps.get(&id)
    }

    pub fn ep_ids(&self) -> Vec<EpId> {
        let mut ids: Vec<_> = self.eps.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn ep_count(&self) -> usize {
        self.eps.len()
    }

    fn insert_ep(&mut self, socket: Box<dyn Socket>, peer: SocketAddr) -> EpId {
        let id = EpId(self.next_id);
        self.next_id += 1;
        let ep = TcpEp::new(id, socket, peer);
        debug!(ep = %id, fd = ep.fd(), %peer, "tcp_ep created");
        self.eps.insert(id, ep);
        id
    }

    /// An endpoint for `peer` serving `cap` that is registered in the
    /// connection index.
    pub fn search_ep(&self, peer: SocketAddr, cap: CtxType) -> Option<EpId> {
        self.res
            .index
            .candidates(peer)
            .find(|id| self.eps.get(id).is_some_and(|ep| ep.caps().has(cap)))
    }

    /// Get a transmit endpoint for `peer`.
    ///
    /// An endpoint already receiving from `peer` is asked to carry TX as
    /// well; if the connection request cannot be sent it is destroyed and the
    /// search repeats. Without one, a new connection is started.
    pub fn ep_create(&mut self, peer: SocketAddr) -> Result<EpId> {
        while let Some(id) = self.search_ep(peer, CtxType::Rx) {
            let Some(ep) = self.eps.get_mut(&id) else {
                self.res.index.remove(peer, id);
                continue;
            };
            match self.cm.send_event(ep, &mut self.res, CmEvent::ConnReq) {
                Ok(()) => {
                    ep.add_ctx_cap(&mut self.res, CtxType::Tx)?;
                    debug!(ep = %id, %peer, "reusing rx endpoint for tx");
                    return Ok(id);
                }
                Err(err) => {
                    debug!(ep = %id, %peer, "connection request failed: {err}");
                    self.destroy_internal(id);
                }
            }
        }
        self.create_connected(peer)
    }

    fn create_connected(&mut self, peer: SocketAddr) -> Result<EpId> {
        let socket = self.connector.connect(peer)?;
        let id = self.insert_ep(socket, peer);
        let Some(ep) = self.eps.get_mut(&id) else {
            return Err(TcpAmError::EndpointNotFound(id.0));
        };
        let status = match self.cm.conn_start(ep, &mut self.res) {
            Ok(()) => ep.add_ctx_cap(&mut self.res, CtxType::Tx),
            Err(err) => Err(err),
        };
        if let Err(err) = status {
            debug!(ep = %id, %peer, "connection start failed: {err}");
            self.destroy_internal(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Adopt an accepted socket; the connection manager resolves its role.
    pub fn ep_accept(&mut self, socket: Box<dyn Socket>, peer: SocketAddr) -> EpId {
        let id = self.insert_ep(socket, peer);
        if let Some(ep) = self.eps.get_mut(&id) {
            ep.set_conn_state(&mut self.res, ConnState::Accepting);
        }
        id
    }

    /// Release an endpoint. A connected duplex endpoint only gives up TX,
    /// since the peer may still be sending on it; it is destroyed when the
    /// peer disconnects.
    pub fn ep_destroy(&mut self, id: EpId) -> Result<()> {
        let ep = self.eps.get_mut(&id).ok_or(TcpAmError::EndpointNotFound(id.0))?;
        if ep.conn_state() == ConnState::Connected && ep.caps().is_duplex() {
            ep.remove_ctx_cap(&mut self.res, CtxType::Tx);
            debug!(ep = %id, caps = %ep.caps(), "tcp_ep kept for rx");
            return Ok(());
        }
        self.destroy_internal(id);
        Ok(())
    }

    fn destroy_internal(&mut self, id: EpId) {
        let Some(mut ep) = self.eps.remove(&id) else {
            return;
        };
        ep.teardown(&mut self.res);
        debug!(ep = %id, peer = %ep.peer_addr(), "tcp_ep destroyed");
    }

    pub fn add_ctx_cap(&mut self, id: EpId, cap: CtxType) -> Result<()> {
        let ep = self.eps.get_mut(&id).ok_or(TcpAmError::EndpointNotFound(id.0))?;
        ep.add_ctx_cap(&mut self.res, cap)
    }

    pub fn remove_ctx_cap(&mut self, id: EpId, cap: CtxType) -> Result<()> {
        let ep = self.eps.get_mut(&id).ok_or(TcpAmError::EndpointNotFound(id.0))?;
        ep.remove_ctx_cap(&mut self.res, cap);
        Ok(())
    }

    /// Move `cap` from one endpoint to another. If the target cannot take
    /// it, the source keeps it and the call fails.
    pub fn move_ctx_cap(&mut self, from: EpId, to: EpId, cap: CtxType) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let mut target = self
            .eps
            .remove(&to)
            .ok_or(TcpAmError::EndpointNotFound(to.0))?;
        let result = match self.eps.get_mut(&from) {
            None => Err(TcpAmError::EndpointNotFound(from.0)),
            Some(source) => {
                source.remove_ctx_cap(&mut self.res, cap);
                match target.add_ctx_cap(&mut self.res, cap) {
                    Ok(()) => {
                        trace!(from = %from, to = %to, %cap, "moved ctx cap");
                        Ok(())
                    }
                    Err(err) => {
                        if let Err(restore) = source.add_ctx_cap(&mut self.res, cap) {
                            warn!(ep = %from, %cap, "unable to restore ctx cap: {restore}");
                        }
                        Err(err)
                    }
                }
            }
        };
        self.eps.insert(to, target);
        result
    }

    /// Connection-manager hook to change an endpoint's state.
    pub fn set_conn_state(&mut self, id: EpId, state: ConnState) -> Result<()> {
        let ep = self.eps.get_mut(&id).ok_or(TcpAmError::EndpointNotFound(id.0))?;
        ep.set_conn_state(&mut self.res, state);
        Ok(())
    }

    /// Schedule failure of `id`; see [`IfaceResources::schedule_failure`].
    pub fn set_failed(&self, id: EpId) {
        self.res.schedule_failure(id);
    }

    /// Read readiness on `id`.
    pub fn progress_rx(&mut self, id: EpId) -> usize {
        let Some(ep) = self.eps.get_mut(&id) else {
            return 0;
        };
        let outcome = ep.progress_rx(&mut self.res, self.cm.as_mut());
        if outcome.destroy {
            self.destroy_internal(id);
        }
        outcome.handled
    }

    /// Write readiness on `id`.
    pub fn progress_tx(&mut self, id: EpId) -> usize {
        let Some(ep) = self.eps.get_mut(&id) else {
            return 0;
        };
        ep.progress_tx(&mut self.res, self.cm.as_mut())
    }

    /// Handle readiness reported for `id`.
    pub fn dispatch(&mut self, id: EpId, events: Events) -> usize {
        let mut count = 0;
        if events.contains(Events::READ) {
            count += self.progress_rx(id);
        }
        if events.contains(Events::WRITE) {
            count += self.progress_tx(id);
        }
        count
    }

    /// Handle deferred endpoint failures. Returns how many were handled.
    pub fn progress(&mut self) -> usize {
        let mut count = 0;
        while let Some(id) = self.res.failures.pop() {
            let Some(ep) = self.eps.get_mut(&id) else {
                continue;
            };
            if !ep.set_failed(&mut self.res) {
                continue;
            }
            count += 1;
            let err = TcpAmError::Unreachable;
            match self.err_handler.as_mut() {
                Some(handler) => handler(id, &err),
                None => warn!(ep = %id, peer = %ep.peer_addr(), "endpoint failed: {err}"),
            }
        }
        count
    }

    /// Wait up to `timeout` for readiness, dispatch it and handle failures.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        let status = self.res.event_set.wait(timeout, &mut ready);
        let mut count = 0;
        if status.is_ok() {
            for &(id, events) in &ready {
                count += self.dispatch(id, events);
            }
        }
        self.ready = ready;
        status?;
        Ok(count + self.progress())
    }
}

impl Drop for TcpIface {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        for id in self.ep_ids() {
            self.destroy_internal(id);
        }
    }
}

//! Transmit path: admission, the three send flavours and write progress.

use std::io::{self, IoSlice};

use bytes::Bytes;
use tracing::{trace, warn};

use super::{EpHandle, TcpEp};
use crate::buffer::BufHandle;
use crate::caps::CtxType;
use crate::endpoint::{Completion, SendStatus};
use crate::error::{Result, TcpAmError};
use crate::events::Events;
use crate::frame::{self, AmHeader, AM_ID_MAX, CTRL_AM_ID, HEADER_LEN, SHORT_HEADER_LEN};
use crate::iface::IfaceResources;
use crate::sock::{send_nb, sendv_nb, Socket};
use crate::zcopy::{self, TxSeg, ZcopyCtx};

fn socket_of(socket: &mut Option<Box<dyn Socket>>) -> io::Result<&mut dyn Socket> {
    match socket {
        Some(sock) => Ok(sock.as_mut()),
        None => Err(io::ErrorKind::NotConnected.into()),
    }
}

impl TcpEp {
    fn am_prepare(&mut self, res: &mut IfaceResources, am_id: u8) -> Result<BufHandle> {
        if am_id >= AM_ID_MAX {
            return Err(TcpAmError::InvalidAmId(am_id));
        }
        match self.check_tx_res() {
            Ok(()) => {}
            Err(TcpAmError::NoResource) => {
                self.mod_events(res, Events::WRITE, Events::NONE);
                return Err(TcpAmError::NoResource);
            }
            Err(err) => return Err(err),
        }
        self.tx_attach(res)
    }

    fn tx_attach(&mut self, res: &mut IfaceResources) -> Result<BufHandle> {
        let Some(handle) = res.tx_pool.get() else {
            warn!(ep = %self.id, pool = res.tx_pool.name(), "unable to get a transmit buffer");
            self.mod_events(res, Events::WRITE, Events::NONE);
            return Err(TcpAmError::NoResource);
        };
        self.tx.attach(handle);
        Ok(handle)
    }

    /// Return the transmit buffer, dropping any unsent bytes from the
    /// outstanding count.
    pub(crate) fn release_tx(&mut self, res: &mut IfaceResources) {
        res.outstanding = res.outstanding.saturating_sub(self.tx.remaining());
        self.tx.reset(&mut res.tx_pool);
    }

    /// Write the buffered bytes past the cursor until they are gone or the
    /// socket would block.
    fn send(&mut self, res: &mut IfaceResources) -> io::Result<usize> {
        let Some(handle) = self.tx.handle() else {
            return Ok(0);
        };
        let sock = socket_of(&mut self.socket)?;
        let mut total = 0;
        while self.tx.need_progress() {
            let sent = send_nb(sock, &res.tx_pool.buf(handle)[self.tx.offset..self.tx.length])?;
            if sent == 0 {
                break;
            }
            res.outstanding -= sent;
            self.tx.offset += sent;
            total += sent;
        }
        Ok(total)
    }

    /// Write the rest of the zero-copy frame until the socket would block;
    /// completes it once drained.
    fn sendv(&mut self, res: &mut IfaceResources) -> io::Result<usize> {
        let mut total = 0;
        while self.tx.need_progress() {
            let (Some(handle), Some(ctx)) = (self.tx.handle(), self.zcopy.as_mut()) else {
                break;
            };
            let sock = socket_of(&mut self.socket)?;
            let sent = {
                let local = res.tx_pool.buf(handle);
                let mut iov = Vec::with_capacity(ctx.remaining_segments());
                ctx.fill_iov(local, &mut iov);
                sendv_nb(sock, &iov)?
            };
            if sent == 0 {
                break;
            }

            self.tx.offset += sent;
            res.outstanding -= sent;
            total += sent;
            if self.tx.need_progress() {
                ctx.advance(sent);
            } else {
                self.complete_zcopy(Ok(()));
            }
        }
        Ok(total)
    }

    /// A write failed hard: drop the frame and schedule endpoint failure.
    fn tx_failed(&mut self, res: &mut IfaceResources, err: &io::Error) {
        warn!(ep = %self.id, peer = %self.peer_addr, fd = self.fd, "send failed: {err}");
        self.complete_zcopy(Err(TcpAmError::Io(io::Error::new(err.kind(), err.to_string()))));
        self.release_tx(res);
        res.schedule_failure(self.id);
    }

    /// Keep write interest while bytes remain, else recycle the buffer.
    fn tx_finish(&mut self, res: &mut IfaceResources) {
        if self.tx.need_progress() {
            self.mod_events(res, Events::WRITE, Events::NONE);
        } else {
            self.release_tx(res);
        }
    }

    /// Send the frame `hdr` already written into the transmit buffer.
    fn am_send(&mut self, res: &mut IfaceResources, hdr: AmHeader) -> Result<()> {
        self.tx.length = hdr.frame_len();
        res.outstanding += self.tx.length;
        match self.send(res) {
            Ok(sent) => {
                trace!(
                    ep = %self.id,
                    am_id = hdr.am_id,
                    len = hdr.length,
                    sent,
                    "am send"
                );
            }
            Err(err) => {
                self.tx_failed(res, &err);
                return Err(err.into());
            }
        }
        self.tx_finish(res);
        Ok(())
    }

    pub(crate) fn am_short(
        &mut self,
        res: &mut IfaceResources,
        am_id: u8,
        header: u64,
        payload: &[u8],
    ) -> Result<()> {
        let size = SHORT_HEADER_LEN + payload.len();
        if size > res.limits.short_max {
            return Err(TcpAmError::PayloadTooLarge {
                size,
                max: res.limits.short_max,
            });
        }
        let handle = self.am_prepare(res, am_id)?;
        let hdr = AmHeader::new(am_id, size as u32);
        hdr.encode_into(res.tx_pool.buf_mut(handle));

        if payload.len() <= res.config.sendv_thresh {
            frame::pack_short(&mut res.tx_pool.buf_mut(handle)[HEADER_LEN..], header, payload);
            return self.am_send(res, hdr);
        }

        let header_bytes = header.to_ne_bytes();
        self.tx.length = hdr.frame_len();
        res.outstanding += self.tx.length;
        let sent = {
            let iov = [
                IoSlice::new(&res.tx_pool.buf(handle)[..HEADER_LEN]),
                IoSlice::new(&header_bytes),
                IoSlice::new(payload),
            ];
            socket_of(&mut self.socket).and_then(|sock| sendv_nb(sock, &iov))
        };
        let sent = match sent {
            Ok(sent) => sent,
            Err(err) => {
                self.tx_failed(res, &err);
                return Err(err.into());
            }
        };
        self.tx.offset = sent;
        res.outstanding -= sent;
        trace!(ep = %self.id, am_id, len = size, sent, "am short sendv");

        if self.tx.need_progress() {
            // the frame header is already in place; copy the unsent body
            let skip = sent.saturating_sub(HEADER_LEN);
            let body = &mut res.tx_pool.buf_mut(handle)[HEADER_LEN + skip..self.tx.length];
            zcopy::gather(&[&header_bytes[..], payload], skip, body);
        }
        self.tx_finish(res);
        Ok(())
    }

    pub(crate) fn am_bcopy(
        &mut self,
        res: &mut IfaceResources,
        am_id: u8,
        pack: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<usize> {
        let handle = self.am_prepare(res, am_id)?;
        let max = res.limits.bcopy_max;
        let packed = pack(&mut res.tx_pool.buf_mut(handle)[HEADER_LEN..HEADER_LEN + max]);
        if packed > max {
            self.release_tx(res);
            return Err(TcpAmError::PayloadTooLarge { size: packed, max });
        }
        let hdr = AmHeader::new(am_id, packed as u32);
        hdr.encode_into(res.tx_pool.buf_mut(handle));
        self.am_send(res, hdr)?;
        Ok(packed)
    }

    pub(crate) fn am_zcopy(
        &mut self,
        res: &mut IfaceResources,
        am_id: u8,
        header: &[u8],
        iov: &[Bytes],
        comp: Option<Completion>,
    ) -> Result<SendStatus> {
        let limits = res.limits;
        if iov.len() > limits.zcopy_max_iov {
            return Err(TcpAmError::TooManyIov {
                count: iov.len(),
                max: limits.zcopy_max_iov,
            });
        }
        if header.len() > limits.zcopy_max_hdr {
            return Err(TcpAmError::HeaderTooLarge {
                size: header.len(),
                max: limits.zcopy_max_hdr,
            });
        }
        let size = header.len() + iov.iter().map(Bytes::len).sum::<usize>();
        if size > limits.frame_max {
            return Err(TcpAmError::PayloadTooLarge {
                size,
                max: limits.frame_max,
            });
        }

        let handle = self.am_prepare(res, am_id)?;
        let hdr = AmHeader::new(am_id, size as u32);
        hdr.encode_into(res.tx_pool.buf_mut(handle));
        self.tx.length = hdr.frame_len();
        res.outstanding += self.tx.length;

        let sent = {
            let mut slices = Vec::with_capacity(iov.len() + 2);
            slices.push(IoSlice::new(&res.tx_pool.buf(handle)[..HEADER_LEN]));
            if !header.is_empty() {
                slices.push(IoSlice::new(header));
            }
            slices.extend(iov.iter().filter(|seg| !seg.is_empty()).map(|seg| IoSlice::new(seg)));
            socket_of(&mut self.socket).and_then(|sock| sendv_nb(sock, &slices))
        };
        let sent = match sent {
            Ok(sent) => sent,
            Err(err) => {
                self.tx_failed(res, &err);
                return Err(err.into());
            }
        };
        self.tx.offset = sent;
        res.outstanding -= sent;
        trace!(ep = %self.id, am_id, len = size, sent, "am zcopy sendv");

        if !self.tx.need_progress() {
            self.release_tx(res);
            return Ok(SendStatus::Done);
        }

        let mut segs = Vec::with_capacity(iov.len() + 2);
        segs.push(TxSeg::Local(0..HEADER_LEN));
        if !header.is_empty() {
            let range = HEADER_LEN..HEADER_LEN + header.len();
            if sent < range.end {
                res.tx_pool.buf_mut(handle)[range.clone()].copy_from_slice(header);
            }
            segs.push(TxSeg::Local(range));
        }
        segs.extend(iov.iter().filter(|seg| !seg.is_empty()).cloned().map(TxSeg::Shared));

        let mut ctx = ZcopyCtx::new(segs, comp);
        ctx.advance(sent);
        self.zcopy = Some(ctx);
        self.set_caps(self.caps.with(CtxType::ZcopyTx));
        self.mod_events(res, Events::WRITE, Events::NONE);
        Ok(SendStatus::InProgress)
    }

    /// Send a connection-management packet. Only requires a socket and an
    /// idle transmit buffer, whatever the connection state.
    pub fn send_ctrl(&mut self, res: &mut IfaceResources, payload: &[u8]) -> Result<()> {
        if self.socket.is_none() {
            return Err(TcpAmError::Unreachable);
        }
        if payload.len() > res.limits.bcopy_max {
            return Err(TcpAmError::PayloadTooLarge {
                size: payload.len(),
                max: res.limits.bcopy_max,
            });
        }
        if !self.tx.is_empty() {
            self.mod_events(res, Events::WRITE, Events::NONE);
            return Err(TcpAmError::NoResource);
        }
        let handle = self.tx_attach(res)?;
        let hdr = AmHeader::new(CTRL_AM_ID, payload.len() as u32);
        let buf = res.tx_pool.buf_mut(handle);
        hdr.encode_into(buf);
        buf[HEADER_LEN..hdr.frame_len()].copy_from_slice(payload);
        self.am_send(res, hdr)
    }

    /// Write readiness in CONNECTED state.
    pub(crate) fn progress_data_tx(&mut self, res: &mut IfaceResources) -> usize {
        let mut count = 0;

        if self.tx.need_progress() {
            let sent = if self.caps.has(CtxType::ZcopyTx) {
                self.sendv(res)
            } else {
                self.send(res)
            };
            match sent {
                Ok(sent) => {
                    trace!(ep = %self.id, sent, remaining = self.tx.remaining(), "tx progress");
                    if sent > 0 {
                        count += 1;
                    }
                }
                Err(err) => {
                    self.tx_failed(res, &err);
                    return count;
                }
            }
            if !self.tx.need_progress() {
                self.release_tx(res);
            }
        }

        if !self.pending.is_empty() {
            return count + self.dispatch_pending(res);
        }
        if self.tx.is_empty() {
            self.mod_events(res, Events::NONE, Events::WRITE);
        }
        count
    }

    /// Replay queued operations while the transmit buffer is free.
    fn dispatch_pending(&mut self, res: &mut IfaceResources) -> usize {
        let mut count = 0;
        while self.tx.is_empty() {
            let Some(mut op) = self.pending.pop_front() else {
                break;
            };
            let status = op.progress(&mut EpHandle::new(self, res));
            match status {
                Ok(()) => count += 1,
                Err(err) => {
                    trace!(ep = %self.id, "pending operation deferred: {err}");
                    self.pending.push_front(op);
                    break;
                }
            }
        }
        if self.tx.is_empty() && self.pending.is_empty() {
            self.mod_events(res, Events::NONE, Events::WRITE);
        }
        count
    }

    /// Write readiness before CONNECTED: drain a buffered control packet.
    pub(crate) fn progress_ctrl_tx(&mut self, res: &mut IfaceResources) -> usize {
        if !self.tx.need_progress() {
            self.mod_events(res, Events::NONE, Events::WRITE);
            return 0;
        }
        match self.send(res) {
            Ok(sent) => {
                if !self.tx.need_progress() {
                    self.release_tx(res);
                    self.mod_events(res, Events::NONE, Events::WRITE);
                }
                usize::from(sent > 0)
            }
            Err(err) => {
                self.tx_failed(res, &err);
                0
            }
        }
    }
}

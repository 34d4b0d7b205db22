//! Transport-independent endpoint operations.

use bytes::Bytes;

use crate::error::Result;
use crate::pending::PendingOp;

/// Completion of a zero-copy send: called exactly once with the final status.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;

/// Outcome of an operation that may finish later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Finished inside the call; the completion is not invoked.
    Done,
    /// Still in flight; the completion fires when it finishes.
    InProgress,
}

/// Operations every endpoint type exposes upstream.
///
/// Sends never block. A transient lack of transmit capacity is reported as
/// [`crate::TcpAmError::NoResource`]; the caller then queues a
/// [`PendingOp`] with [`Endpoint::pending_add`].
pub trait Endpoint {
    /// Send `header` followed by `payload` as one active message.
    fn am_short(&mut self, am_id: u8, header: u64, payload: &[u8]) -> Result<()>;

    /// Let `pack` write the payload straight into the transmit buffer and
    /// return its length. Returns the packed length.
    fn am_bcopy(&mut self, am_id: u8, pack: &mut dyn FnMut(&mut [u8]) -> usize)
        -> Result<usize>;

    /// Send `header` followed by the caller-owned `iov` segments without
    /// copying them.
    fn am_zcopy(
        &mut self,
        am_id: u8,
        header: &[u8],
        iov: &[Bytes],
        comp: Option<Completion>,
    ) -> Result<SendStatus>;

    /// Queue `op` until transmit capacity frees up.
    fn pending_add(&mut self, op: Box<dyn PendingOp>) -> Result<()>;

    /// Remove every queued operation, handing each to `cb`.
    fn pending_purge(&mut self, cb: &mut dyn FnMut(Box<dyn PendingOp>));

    /// `Ok(())` when nothing is in flight, `Err(NoResource)` otherwise.
    fn flush(&mut self) -> Result<()>;
}

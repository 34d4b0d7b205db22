//! Interface configuration.
//!
//! All limits the endpoint engine needs are derived here once, when the
//! interface is constructed, and handed down to every endpoint operation.

use crate::error::{Result, TcpAmError};
use crate::frame::{HEADER_LEN, SHORT_HEADER_LEN};

/// Upper bound on the iovec count accepted by a single vectored write.
pub const SYS_IOV_MAX: usize = 1024;

/// Scatter-gather entries a zero-copy send reserves for itself: the frame
/// header and the optional user header.
pub const ZCOPY_SERVICE_IOV: usize = 2;

/// Tunables of one TCP interface.
#[derive(Debug, Clone)]
pub struct IfaceConfig {
    /// Size of each transmit pool buffer.
    pub tx_seg_size: usize,
    /// Size of each receive pool buffer; caps the frame length.
    pub rx_seg_size: usize,
    /// Short sends with a payload at or below this size are copied next to
    /// the header and sent with a single write.
    pub sendv_thresh: usize,
    /// Maximum iovec entries per vectored write.
    pub max_iov: usize,
    /// Maximum number of transmit buffers.
    pub tx_pool_size: usize,
    /// Maximum number of receive buffers.
    pub rx_pool_size: usize,
}

impl Default for IfaceConfig {
    fn default() -> Self {
        Self {
            tx_seg_size: 8 * 1024,
            rx_seg_size: 64 * 1024,
            sendv_thresh: 2 * 1024,
            max_iov: 8,
            tx_pool_size: 256,
            rx_pool_size: 256,
        }
    }
}

impl IfaceConfig {
    /// Check that the values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.tx_seg_size <= HEADER_LEN + SHORT_HEADER_LEN {
            return Err(TcpAmError::InvalidConfig(format!(
                "tx_seg_size {} must exceed {}",
                self.tx_seg_size,
                HEADER_LEN + SHORT_HEADER_LEN
            )));
        }
        if self.rx_seg_size <= HEADER_LEN {
            return Err(TcpAmError::InvalidConfig(format!(
                "rx_seg_size {} must exceed {}",
                self.rx_seg_size, HEADER_LEN
            )));
        }
        if self.tx_seg_size > self.rx_seg_size {
            return Err(TcpAmError::InvalidConfig(format!(
                "tx_seg_size {} exceeds rx_seg_size {}",
                self.tx_seg_size, self.rx_seg_size
            )));
        }
        if self.max_iov <= ZCOPY_SERVICE_IOV {
            return Err(TcpAmError::InvalidConfig(format!(
                "max_iov {} must exceed {}",
                self.max_iov, ZCOPY_SERVICE_IOV
            )));
        }
        if self.tx_pool_size == 0 || self.rx_pool_size == 0 {
            return Err(TcpAmError::InvalidConfig("pool sizes must be non-zero".into()));
        }
        u32::try_from(self.rx_seg_size)
            .map_err(|_| TcpAmError::InvalidConfig("rx_seg_size exceeds u32".into()))?;
        Ok(())
    }

    /// Compute the per-interface send limits.
    pub fn limits(&self) -> SendLimits {
        SendLimits {
            short_max: self.tx_seg_size - HEADER_LEN,
            bcopy_max: self.tx_seg_size - HEADER_LEN,
            zcopy_max_iov: self.max_iov.min(SYS_IOV_MAX) - ZCOPY_SERVICE_IOV,
            zcopy_max_hdr: self.tx_seg_size - HEADER_LEN,
            frame_max: self.rx_seg_size - HEADER_LEN,
        }
    }
}

/// Send limits derived from [`IfaceConfig`], fixed for the interface lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLimits {
    /// Largest short-send body (8-byte header scalar + payload).
    pub short_max: usize,
    /// Largest bcopy payload.
    pub bcopy_max: usize,
    /// Largest payload segment count of a zero-copy send.
    pub zcopy_max_iov: usize,
    /// Largest user header of a zero-copy send.
    pub zcopy_max_hdr: usize,
    /// Largest frame payload the receiver can reassemble.
    pub frame_max: usize,
}

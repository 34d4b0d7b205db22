//! Active-message wire framing.
//!
//! Binary layout (host byte order, peers are assumed to share it):
//!
//! ```text
//! +-------+------------+---- variable ----+
//! | am_id |   length   |     payload      |
//! | (1B)  |    (4B)    |  (length bytes)  |
//! +-------+------------+------------------+
//! ```
//!
//! Frames are packed back to back with no padding. Ids below [`AM_ID_MAX`]
//! carry user active messages; ids at or above it carry connection-management
//! control packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TcpAmError};

/// Size of the frame header on the wire.
pub const HEADER_LEN: usize = 5;
/// Number of user active-message ids.
pub const AM_ID_MAX: u8 = 32;
/// Id used for connection-management control frames.
pub const CTRL_AM_ID: u8 = AM_ID_MAX;
/// Size of the header scalar carried by a short send.
pub const SHORT_HEADER_LEN: usize = 8;

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmHeader {
    pub am_id: u8,
    pub length: u32,
}

impl AmHeader {
    pub fn new(am_id: u8, length: u32) -> Self {
        Self { am_id, length }
    }

    /// Control frames are routed to the connection manager.
    pub fn is_control(&self) -> bool {
        self.am_id >= AM_ID_MAX
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }

    /// Write the header into the first [`HEADER_LEN`] bytes of `dst`.
    pub fn encode_into(&self, mut dst: &mut [u8]) {
        debug_assert!(dst.len() >= HEADER_LEN);
        dst.put_u8(self.am_id);
        dst.put_u32_ne(self.length);
    }

    /// Parse a header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(TcpAmError::FrameTooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut buf = &data[..HEADER_LEN];
        let am_id = buf.get_u8();
        let length = buf.get_u32_ne();
        Ok(Self { am_id, length })
    }
}

/// Copy a short-send body (`header` scalar followed by `payload`) into `dst`.
/// Returns the number of bytes written.
pub fn pack_short(mut dst: &mut [u8], header: u64, payload: &[u8]) -> usize {
    dst.put_u64_ne(header);
    dst.put_slice(payload);
    SHORT_HEADER_LEN + payload.len()
}

/// Split a short-send body back into its header scalar and payload.
pub fn unpack_short(body: &[u8]) -> Result<(u64, &[u8])> {
    if body.len() < SHORT_HEADER_LEN {
        return Err(TcpAmError::FrameTooShort {
            expected: SHORT_HEADER_LEN,
            actual: body.len(),
        });
    }
    let (mut head, payload) = body.split_at(SHORT_HEADER_LEN);
    Ok((head.get_u64_ne(), payload))
}

/// An owned active-message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub am_id: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(am_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            am_id,
            payload: payload.into(),
        }
    }

    pub fn header(&self) -> AmHeader {
        AmHeader::new(self.am_id, self.payload.len() as u32)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode this frame into a byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.am_id);
        buf.put_u32_ne(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Decode one complete frame from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = AmHeader::decode(data)?;
        if data.len() < header.frame_len() {
            return Err(TcpAmError::FrameTooShort {
                expected: header.frame_len(),
                actual: data.len(),
            });
        }
        Ok(Self {
            am_id: header.am_id,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..header.frame_len()]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_id_then_native_length() {
        let mut raw = [0u8; HEADER_LEN];
        AmHeader::new(7, 0x0102_0304).encode_into(&mut raw);
        assert_eq!(raw[0], 7);
        assert_eq!(&raw[1..], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(AmHeader::decode(&raw).unwrap(), AmHeader::new(7, 0x0102_0304));
    }

    #[test]
    fn control_ids_start_at_am_id_max() {
        assert!(!AmHeader::new(AM_ID_MAX - 1, 0).is_control());
        assert!(AmHeader::new(CTRL_AM_ID, 0).is_control());
        assert!(AmHeader::new(u8::MAX, 0).is_control());
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            AmHeader::decode(&[1, 2, 3]),
            Err(TcpAmError::FrameTooShort {
                expected: HEADER_LEN,
                actual: 3
            })
        ));
    }

    #[test]
    fn frames_pack_back_to_back() {
        let mut buf = BytesMut::new();
        Frame::new(1, &b"ab"[..]).encode_into(&mut buf);
        Frame::new(2, Bytes::new()).encode_into(&mut buf);
        assert_eq!(buf.len(), 2 * HEADER_LEN + 2);

        let first = Frame::decode(&buf).unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"ab"));
        let second = Frame::decode(&buf[first.encoded_len()..]).unwrap();
        assert_eq!(second.am_id, 2);
        assert!(second.payload.is_empty());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let encoded = Frame::new(3, &b"hello"[..]).encode();
        assert!(Frame::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn short_body_carries_header_scalar() {
        let mut buf = [0u8; 32];
        let n = pack_short(&mut buf, 0xdead_beef, b"xyz");
        assert_eq!(n, SHORT_HEADER_LEN + 3);
        let (header, payload) = unpack_short(&buf[..n]).unwrap();
        assert_eq!(header, 0xdead_beef);
        assert_eq!(payload, b"xyz");
    }
}

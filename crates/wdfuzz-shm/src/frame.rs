//! Packet framing inside a channel buffer.
//!
//! ```text
//! u16 total_len | u8 event_type | u8 flags | payload ... | u64 correlation_id
//! ```
//!
//! All integers are native-endian: both ends of a channel live on the same
//! host. The correlation trailer is only present when time tagging is on.

use std::ops::Range;

use bitflags::bitflags;

use crate::error::TransportError;

/// `total_len`, `event_type` and `flags`.
pub const FRAME_HEADER_LEN: usize = 4;
/// Trailing correlation id.
pub const CORRELATION_TRAILER_LEN: usize = 8;

bitflags! {
    /// Per-frame flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// The target is about to transmit this packet and waits for it to be written back.
        const INTERCEPT_TX = 1 << 0;
        /// The frame is a re-injected duplicate.
        const DUPLICATED = 1 << 1;
    }
}

/// Owned frame, used when building outgoing traffic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketFrame {
    pub event_type: u8,
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
    pub correlation_id: u64,
}

/// Borrowed view of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub event_type: u8,
    pub flags: FrameFlags,
    pub payload: &'a [u8],
    pub correlation_id: Option<u64>,
}

/// Mutable view; the payload can be rewritten in place before notifying the peer.
#[derive(Debug)]
pub struct FrameMut<'a> {
    pub event_type: u8,
    pub flags: FrameFlags,
    pub payload: &'a mut [u8],
    pub correlation_id: Option<u64>,
}

struct Layout {
    event_type: u8,
    flags: FrameFlags,
    payload: Range<usize>,
    correlation_id: Option<u64>,
}

/// Encoder/decoder for one transport configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    time_tagging: bool,
}

impl FrameCodec {
    pub fn new(time_tagging: bool) -> Self {
        Self { time_tagging }
    }

    /// Bytes of framing around the payload.
    pub fn overhead(&self) -> usize {
        if self.time_tagging {
            FRAME_HEADER_LEN + CORRELATION_TRAILER_LEN
        } else {
            FRAME_HEADER_LEN
        }
    }

    /// Largest payload that fits in a buffer of `capacity` bytes.
    pub fn max_payload(&self, capacity: usize) -> usize {
        capacity
            .min(u16::MAX as usize)
            .saturating_sub(self.overhead())
    }

    pub fn encoded_len(&self, payload_len: usize) -> usize {
        payload_len + self.overhead()
    }

    /// Write `frame` at the start of `buf`, returning the encoded length.
    pub fn encode(&self, frame: &PacketFrame, buf: &mut [u8]) -> Result<usize, TransportError> {
        let total = self.encoded_len(frame.payload.len());
        if frame.payload.len() > self.max_payload(buf.len()) {
            return Err(TransportError::FrameTooLarge {
                declared: frame.payload.len(),
                capacity: self.max_payload(buf.len()),
            });
        }

        buf[0..2].copy_from_slice(&(total as u16).to_ne_bytes());
        buf[2] = frame.event_type;
        buf[3] = frame.flags.bits();
        let end = FRAME_HEADER_LEN + frame.payload.len();
        buf[FRAME_HEADER_LEN..end].copy_from_slice(&frame.payload);
        if self.time_tagging {
            buf[end..end + CORRELATION_TRAILER_LEN]
                .copy_from_slice(&frame.correlation_id.to_ne_bytes());
        }
        Ok(total)
    }

    fn layout(&self, buf: &[u8]) -> Result<Layout, TransportError> {
        if buf.len() < self.overhead() {
            return Err(TransportError::MalformedFrame {
                details: format!("buffer of {} bytes cannot hold a frame", buf.len()),
            });
        }
        let total = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        if total < self.overhead() {
            return Err(TransportError::MalformedFrame {
                details: format!("total_len {total} shorter than framing"),
            });
        }

        let payload_len = total - self.overhead();
        let capacity = buf.len() - self.overhead();
        if payload_len > capacity {
            return Err(TransportError::FrameTooLarge {
                declared: payload_len,
                capacity,
            });
        }

        let payload = FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload_len;
        let correlation_id = if self.time_tagging {
            let mut raw = [0u8; CORRELATION_TRAILER_LEN];
            raw.copy_from_slice(&buf[payload.end..payload.end + CORRELATION_TRAILER_LEN]);
            Some(u64::from_ne_bytes(raw))
        } else {
            None
        };

        Ok(Layout {
            event_type: buf[2],
            flags: FrameFlags::from_bits_retain(buf[3]),
            payload,
            correlation_id,
        })
    }

    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<FrameRef<'a>, TransportError> {
        let layout = self.layout(buf)?;
        Ok(FrameRef {
            event_type: layout.event_type,
            flags: layout.flags,
            payload: &buf[layout.payload],
            correlation_id: layout.correlation_id,
        })
    }

    pub fn decode_mut<'a>(&self, buf: &'a mut [u8]) -> Result<FrameMut<'a>, TransportError> {
        let layout = self.layout(buf)?;
        Ok(FrameMut {
            event_type: layout.event_type,
            flags: layout.flags,
            payload: &mut buf[layout.payload],
            correlation_id: layout.correlation_id,
        })
    }
}

impl FrameRef<'_> {
    pub fn to_owned_frame(&self) -> PacketFrame {
        PacketFrame {
            event_type: self.event_type,
            flags: self.flags,
            payload: self.payload.to_vec(),
            correlation_id: self.correlation_id.unwrap_or(0),
        }
    }
}

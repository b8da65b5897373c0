use std::io;

/// Errors raised by the shared-memory transport and the message-queue side channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `wait` exceeded the configured timeout without the peer notifying.
    #[error("Timed out waiting on channel {channel}")]
    Timeout { channel: u8 },

    /// A frame declared more payload than the channel buffer can hold.
    #[error("Frame too large: declared {declared} bytes, capacity {capacity}")]
    FrameTooLarge { declared: usize, capacity: usize },

    /// The frame header itself is truncated or inconsistent.
    #[error("Malformed frame: {details}")]
    MalformedFrame { details: String },

    #[error("Invalid segment layout: {details}")]
    InvalidLayout { details: String },

    #[error("Channel {0} out of range")]
    InvalidChannel(u8),

    #[error("Message of {len} bytes exceeds queue message size {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// An OS call failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Capture `errno` for the named OS operation.
    pub(crate) fn last_os(op: &'static str) -> Self {
        TransportError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Build from a pthread-style return code (the error is returned, not stored in errno).
    pub(crate) fn from_code(op: &'static str, code: i32) -> Self {
        TransportError::Os {
            op,
            source: io::Error::from_raw_os_error(code),
        }
    }

    /// True for errors a channel loop should recover from by resyncing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::FrameTooLarge { .. }
                | TransportError::MalformedFrame { .. }
        )
    }
}

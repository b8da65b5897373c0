//! Shared-memory rendezvous transport.
//!
//! A fixed segment split into numbered channels, each a buffer plus a pair
//! of cross-process signals, for synchronous packet handoff with the target.
//! A POSIX message queue per channel provides asynchronous injection, with
//! an optional pump thread feeding a lock-free bipartite buffer.

pub mod bipbuf;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod mqueue;
pub mod segment;
pub mod signal;

pub use channel::{Channel, Rendezvous};
pub use config::ShmConfig;
pub use error::TransportError;
pub use frame::{FrameCodec, FrameFlags, FrameMut, FrameRef, PacketFrame};
pub use mqueue::{MessageQueue, MqMessage, MqSender};
pub use segment::{Role, SegmentLayout, ShmSegment};

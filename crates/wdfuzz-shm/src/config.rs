/// Transport configuration: segment geometry, handshake timeout, side channel.
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by both ends of the rendezvous transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// File whose identity seeds the segment key (created if missing).
    pub key_path: PathBuf,
    /// Number of independent channels in the segment.
    pub max_channels: u8,
    /// Bytes per channel buffer (default: 16 KiB).
    pub buffer_size: usize,
    /// Handshake timeout. None = wait forever.
    pub timeout_ms: Option<u64>,
    /// Append a u64 correlation id to every frame.
    pub time_tagging: bool,
    /// Base name of the per-channel POSIX message queues.
    pub mq_name: String,
    /// Maximum queued messages per side channel.
    pub mq_depth: usize,
    /// Drain the side channel on a background thread through a bipartite buffer.
    pub mq_pump_thread: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("/tmp/wshm"),
            max_channels: 16,
            buffer_size: 16 * 1024,
            timeout_ms: None,
            time_tagging: true,
            mq_name: "/wshm".to_string(),
            mq_depth: 32,
            mq_pump_thread: false,
        }
    }
}

impl ShmConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

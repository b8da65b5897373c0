//! Per-packet events and engine-wide counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use wdfuzz_model::{Direction, LoopReason};

/// What one channel thread observed and decided for one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketEvent {
    pub channel: u8,
    /// Per-channel packet counter.
    pub sequence: u64,
    pub event_type: u8,
    pub direction: Direction,
    /// The packet as released to the target.
    pub buffer: Vec<u8>,
    /// The packet as intercepted, kept when it was mutated.
    pub original: Option<Vec<u8>>,
    pub summary: String,
    /// State the model is in after this packet.
    pub state: Option<String>,
    pub new_transition: bool,
    pub loop_detected: Option<LoopReason>,
    pub fuzzed: bool,
    pub fields_mutated: u32,
    /// The frame is a re-injected duplicate.
    pub duplicated: bool,
    /// Correlation id carried by a duplicate.
    pub duplicate_of: Option<u64>,
    /// Id of the duplicate scheduled from this packet.
    pub duplicate_scheduled: Option<u64>,
    /// Time from the end of `wait` to the decision being complete.
    pub latency_ns: u64,
}

impl fmt::Display for PacketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Tx => "-->",
            Direction::Rx => "<--",
        };
        if self.fuzzed {
            f.write_str("[M] ")?;
        }
        match (self.duplicated, self.duplicate_of) {
            (true, Some(id)) => write!(f, "[D:{id}] ")?,
            (true, None) => f.write_str("[D] ")?,
            _ => {}
        }
        write!(f, "{} {arrow} {}", self.direction, self.summary)?;
        if let Some(state) = &self.state {
            write!(f, "  ({state})")?;
        }
        Ok(())
    }
}

/// Lock-free counters updated by the event consumer.
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_tx: AtomicU64,
    packets_rx: AtomicU64,
    fuzzed: AtomicU64,
    duplicated: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub packets_tx: u64,
    pub packets_rx: u64,
    pub fuzzed: u64,
    pub duplicated: u64,
    pub dropped: u64,
    pub timeouts: u64,
}

impl EngineStats {
    pub fn record(&self, event: &PacketEvent) {
        match event.direction {
            Direction::Tx => self.packets_tx.fetch_add(1, Ordering::Relaxed),
            Direction::Rx => self.packets_rx.fetch_add(1, Ordering::Relaxed),
        };
        if event.fuzzed {
            self.fuzzed.fetch_add(1, Ordering::Relaxed);
        }
        if event.duplicate_scheduled.is_some() {
            self.duplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A frame that could not be decoded.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A channel wait that timed out.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            fuzzed: self.fuzzed.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

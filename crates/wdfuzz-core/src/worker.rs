//! Per-channel packet pipeline.
//!
//! Each channel thread owns a [`PacketProcessor`] and runs
//! `wait -> dissect -> exclude -> map -> mutate -> notify -> duplicate`.
//! Everything up to the mutation happens while the target is blocked;
//! duplication and event reporting happen after it has been released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, trace, warn};
use wdfuzz_explore::{channel_rng, DuplicationScheduler, MutationEngine, MutationReport};
use wdfuzz_model::{
    Direction, Dissector, DissectorFactory, ExcludeMask, ExclusionEngine, MapOutcome,
    StateMapper, TransitionOutcome,
};
use wdfuzz_shm::{Channel, FrameFlags, FrameMut};

use crate::collab::LogSink;
use crate::event::{EngineStats, PacketEvent};

/// Components every channel shares.
#[derive(Clone)]
pub struct SharedComponents {
    pub mapper: Arc<Mutex<StateMapper>>,
    pub exclusion: Arc<ExclusionEngine>,
    pub mutation: Arc<MutationEngine>,
    pub duplication: Option<Arc<DuplicationScheduler>>,
}

/// Decisions taken while the target was blocked.
#[derive(Debug)]
pub struct Intercepted {
    event_type: u8,
    direction: Direction,
    duplicated: bool,
    duplicate_of: Option<u64>,
    buffer: Vec<u8>,
    original: Vec<u8>,
    summary: String,
    exclude: ExcludeMask,
    mapped: MapOutcome,
    state: Option<String>,
    mutation: MutationReport,
    latency_ns: u64,
}

pub struct PacketProcessor {
    channel: u8,
    dissector: Box<dyn Dissector>,
    rng: ChaCha8Rng,
    shared: SharedComponents,
    sequence: u64,
}

impl PacketProcessor {
    pub fn new(
        channel: u8,
        factory: &dyn DissectorFactory,
        shared: SharedComponents,
        seed: u64,
    ) -> Self {
        let mut dissector = factory.create();
        shared.mapper.lock().prepare(dissector.as_mut());
        shared.exclusion.prepare(dissector.as_mut());
        Self {
            channel,
            dissector,
            rng: channel_rng(seed, channel),
            shared,
            sequence: 0,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Classify and maybe mutate `frame` in place.
    pub fn intercept(&mut self, frame: &mut FrameMut<'_>) -> Intercepted {
        let started = Instant::now();
        let direction = if frame.flags.contains(FrameFlags::INTERCEPT_TX) {
            Direction::Tx
        } else {
            Direction::Rx
        };
        let duplicated = frame.flags.contains(FrameFlags::DUPLICATED);

        let tree = self.dissector.dissect(frame.payload, direction);
        let summary = self.dissector.summary(&tree);
        let exclude = self.shared.exclusion.evaluate(self.dissector.as_ref(), &tree);

        // Duplicates replay an already mapped packet.
        let (mapped, state, state_block) = if duplicated || exclude.forbids(ExcludeMask::MAPPING) {
            let mapper = self.shared.mapper.lock();
            (
                MapOutcome::default(),
                mapper.current_state_name().map(str::to_string),
                mapper.current_block(),
            )
        } else {
            let mut mapper = self.shared.mapper.lock();
            let mapped = mapper.map_packet(self.dissector.as_ref(), &tree, true);
            (
                mapped,
                mapper.current_state_name().map(str::to_string),
                mapper.current_block(),
            )
        };

        let original = frame.payload.to_vec();
        let mutation = if direction == Direction::Tx && !duplicated {
            self.shared.mutation.packet_fuzzing(
                &mut self.rng,
                &tree,
                frame.payload,
                state_block,
                exclude,
            )
        } else {
            MutationReport::default()
        };
        if mutation.fuzzed {
            trace!(channel = self.channel, fields = mutation.fields_mutated, "packet mutated");
        }

        Intercepted {
            event_type: frame.event_type,
            direction,
            duplicated,
            duplicate_of: if duplicated { frame.correlation_id } else { None },
            buffer: frame.payload.to_vec(),
            original,
            summary,
            exclude,
            mapped,
            state,
            mutation,
            latency_ns: started.elapsed().as_nanos() as u64,
        }
    }

    /// Work left once the target has been released: duplication and the event.
    pub fn complete(&mut self, intercepted: Intercepted) -> PacketEvent {
        let Intercepted {
            event_type,
            direction,
            duplicated,
            duplicate_of,
            buffer,
            original,
            summary,
            exclude,
            mapped,
            state,
            mutation,
            latency_ns,
        } = intercepted;
        let sequence = self.sequence;
        self.sequence += 1;

        let duplicate_scheduled = match &self.shared.duplication {
            Some(scheduler) if direction == Direction::Tx && !duplicated => {
                scheduler
                    .packet_duplication(&mut self.rng, self.channel, &original, sequence, exclude)
                    .map(|ticket| {
                        debug!(
                            channel = self.channel,
                            id = ticket.id,
                            delay_ms = ticket.delay.as_millis() as u64,
                            "duplicate scheduled"
                        );
                        ticket.id
                    })
            }
            _ => None,
        };

        PacketEvent {
            channel: self.channel,
            sequence,
            event_type,
            direction,
            buffer,
            original: mutation.fuzzed.then_some(original),
            summary,
            state,
            new_transition: matches!(
                mapped.transition,
                Some(TransitionOutcome::Moved { new_edge: true, .. })
            ),
            loop_detected: mapped.loop_detected,
            fuzzed: mutation.fuzzed,
            fields_mutated: mutation.fields_mutated,
            duplicated,
            duplicate_of,
            duplicate_scheduled,
            latency_ns,
        }
    }

    /// Both halves back to back, for frames that are not being held by a peer.
    pub fn process(&mut self, frame: &mut FrameMut<'_>) -> PacketEvent {
        let intercepted = self.intercept(frame);
        self.complete(intercepted)
    }
}

/// Flags every channel loop watches.
#[derive(Debug, Clone, Default)]
pub struct ChannelControl {
    stop: Arc<AtomicBool>,
    target_restarts: Arc<AtomicU64>,
}

impl ChannelControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The target died or was restarted. Channels still stuck in a
    /// handshake with the old process resync on their next timeout.
    pub fn target_restarted(&self) {
        self.target_restarts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn target_restarts(&self) -> u64 {
        self.target_restarts.load(Ordering::Acquire)
    }
}

/// Service one channel until stopped, the event consumer goes away, or
/// the transport fails for good.
///
/// A timeout alone never resyncs the channel: a live peer may notify right
/// after it. Only a timeout following a target restart, with no traffic
/// since, clears the handshake.
pub fn run_channel(
    mut channel: Channel,
    mut processor: PacketProcessor,
    events: Sender<PacketEvent>,
    stats: Arc<EngineStats>,
    control: ChannelControl,
    sink: Arc<dyn LogSink>,
) {
    let id = channel.id();
    let mut restarts_seen = control.target_restarts();
    debug!(channel = id, "channel loop started");
    while !control.is_stopped() {
        match channel.wait() {
            Ok(()) => restarts_seen = control.target_restarts(),
            Err(e) if e.is_recoverable() => {
                stats.record_timeout();
                let restarts = control.target_restarts();
                if restarts != restarts_seen {
                    restarts_seen = restarts;
                    channel.resync();
                    info!(channel = id, "handshake cleared after target restart");
                }
                continue;
            }
            Err(e) => {
                error!(channel = id, error = %e, "channel failed");
                sink.write(&format!("channel {id}: {e}"), true);
                break;
            }
        }

        let intercepted = match channel.frame() {
            Ok(mut frame) => Ok(processor.intercept(&mut frame)),
            Err(e) => Err(e),
        };
        channel.notify();

        match intercepted {
            Ok(intercepted) => {
                let event = processor.complete(intercepted);
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                stats.record_dropped();
                warn!(channel = id, error = %e, "frame dropped");
                sink.write(&format!("channel {id}: dropped frame: {e}"), true);
            }
        }
    }
    debug!(channel = id, "channel loop stopped");
}

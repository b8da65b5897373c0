//! Timed re-transmission of intercepted packets.
//!
//! A duplicate is decided on the channel thread, then handed to a private
//! event loop (a current-thread tokio runtime on its own OS thread) that
//! sleeps for the drawn delay and delivers the copy through the sink
//! registered for the packet's channel. The number of duplicates scheduled
//! but not yet delivered never exceeds the configured cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wdfuzz_model::ExcludeMask;
use wdfuzz_shm::{MqSender, TransportError};

use crate::config::FuzzingConfig;

/// Where scheduled duplicates are delivered.
pub trait DuplicateSink: Send + Sync {
    fn deliver(&self, duplicate: &Duplicate) -> Result<(), TransportError>;
}

impl DuplicateSink for MqSender {
    fn deliver(&self, duplicate: &Duplicate) -> Result<(), TransportError> {
        self.send(&duplicate.payload, duplicate.correlation_id)
    }
}

/// A copy of an original packet awaiting re-transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Duplicate {
    pub id: u64,
    pub channel: u8,
    /// Pre-mutation bytes of the original.
    pub payload: Vec<u8>,
    /// Sequence number the original had, carried on the wire.
    pub correlation_id: u64,
    pub delay: Duration,
}

/// Handle to an accepted duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateTicket {
    pub id: u64,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicationSettings {
    pub enabled: bool,
    pub probability: f64,
    pub max_delay_ms: u64,
    pub max_pending: usize,
}

impl From<&FuzzingConfig> for DuplicationSettings {
    fn from(config: &FuzzingConfig) -> Self {
        Self {
            enabled: config.enable_duplication,
            probability: config.default_duplication_probability,
            max_delay_ms: config.max_duplication_time_ms.max(1),
            max_pending: config.max_pending_duplicates,
        }
    }
}

struct Shared {
    sinks: RwLock<HashMap<u8, Arc<dyn DuplicateSink>>>,
    pending: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn fire(&self, duplicate: Duplicate) {
        let sink = self.sinks.read().get(&duplicate.channel).cloned();
        match sink {
            Some(sink) => match sink.deliver(&duplicate) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        channel = duplicate.channel,
                        id = duplicate.id,
                        delay_ms = duplicate.delay.as_millis() as u64,
                        "duplicate sent"
                    );
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = duplicate.channel, id = duplicate.id, error = %e, "duplicate dropped");
                }
            },
            None => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(channel = duplicate.channel, id = duplicate.id, "no duplicate sink for channel");
            }
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct DuplicationScheduler {
    settings: DuplicationSettings,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    jobs: Mutex<Option<mpsc::UnboundedSender<Duplicate>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DuplicationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicationScheduler")
            .field("settings", &self.settings)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl DuplicationScheduler {
    /// Start the event loop thread.
    pub fn start(settings: DuplicationSettings) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            sinks: RwLock::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Duplicate>();

        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("dup-loop".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(duplicate) = rx.recv().await {
                        let shared = Arc::clone(&loop_shared);
                        tokio::spawn(async move {
                            tokio::time::sleep(duplicate.delay).await;
                            shared.fire(duplicate);
                        });
                    }
                });
            })?;

        Ok(Self {
            settings,
            shared,
            next_id: AtomicU64::new(0),
            jobs: Mutex::new(Some(tx)),
            event_loop: Mutex::new(Some(handle)),
        })
    }

    pub fn settings(&self) -> &DuplicationSettings {
        &self.settings
    }

    pub fn register_sink(&self, channel: u8, sink: Arc<dyn DuplicateSink>) {
        self.shared.sinks.write().insert(channel, sink);
    }

    /// Duplicates scheduled and not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Maybe schedule a delayed copy of `original`.
    ///
    /// `original` must be the packet as it was before any mutation.
    pub fn packet_duplication<R: Rng>(
        &self,
        rng: &mut R,
        channel: u8,
        original: &[u8],
        sequence: u64,
        exclude: ExcludeMask,
    ) -> Option<DuplicateTicket> {
        if !self.settings.enabled || exclude.forbids(ExcludeMask::DUPLICATION) {
            return None;
        }
        if rng.gen::<f64>() >= self.settings.probability {
            return None;
        }

        let cap = self.settings.max_pending;
        if self
            .shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| (p < cap).then_some(p + 1))
            .is_err()
        {
            debug!(channel, cap, "duplicate cap reached");
            return None;
        }

        let delay = Duration::from_millis(rng.gen_range(1..=self.settings.max_delay_ms));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let duplicate = Duplicate {
            id,
            channel,
            payload: original.to_vec(),
            correlation_id: sequence,
            delay,
        };

        let queued = self
            .jobs
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(duplicate).is_ok());
        if !queued {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(DuplicateTicket { id, delay })
    }

    /// Stop the event loop. Duplicates still waiting are abandoned.
    pub fn shutdown(&self) {
        self.jobs.lock().take();
        if let Some(handle) = self.event_loop.lock().take() {
            if handle.join().is_err() {
                warn!("duplicate event loop panicked");
            }
        }
    }
}

impl Drop for DuplicationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

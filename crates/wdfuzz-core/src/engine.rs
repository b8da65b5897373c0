//! The fuzzing engine context.
//!
//! [`FuzzingEngine`] owns every shared component for the lifetime of a run:
//! the state mapper behind its coarse lock, the exclusion rules, the mutation
//! and duplication engines, the fitness engine and the watchdog. Channel
//! threads feed [`PacketEvent`]s to a single consumer which keeps the
//! statistics, writes the packet log and marks campaign iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use wdfuzz_explore::{
    DuplicateSink, DuplicationScheduler, DuplicationSettings, FitnessEngine, MutationEngine,
    MutationSettings, Optimizer, StopReason,
};
use wdfuzz_model::{Direction, DissectorFactory, ExclusionEngine, StateMapper};
use wdfuzz_shm::{MessageQueue, Rendezvous, Role};

use crate::collab::{LogSink, Supervisor, TracingLogSink};
use crate::config::FuzzerConfig;
use crate::error::EngineError;
use crate::event::{EngineStats, PacketEvent, StatsSnapshot};
use crate::watchdog::Watchdog;
use crate::worker::{run_channel, ChannelControl, PacketProcessor, SharedComponents};

type StopCallback = Box<dyn Fn(StopReason) + Send + Sync>;

pub struct EngineBuilder {
    config: FuzzerConfig,
    factory: Arc<dyn DissectorFactory>,
    log_sink: Arc<dyn LogSink>,
    supervisor: Option<Arc<dyn Supervisor>>,
    optimizer: Option<Box<dyn Optimizer>>,
    on_stop: Option<StopCallback>,
}

impl EngineBuilder {
    pub fn new(config: FuzzerConfig, factory: Arc<dyn DissectorFactory>) -> Self {
        Self {
            config,
            factory,
            log_sink: Arc::new(TracingLogSink),
            supervisor: None,
            optimizer: None,
            on_stop: None,
        }
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// The watchdog restarts the target through `supervisor`.
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Replace the built-in particle swarm.
    pub fn optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Called once when a campaign stop condition is reached.
    pub fn on_stop(mut self, callback: impl Fn(StopReason) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(callback));
        self
    }

    /// Load rules and models and start the fitness engine and watchdog.
    /// No transport is opened.
    pub fn build(self) -> Result<FuzzingEngine, EngineError> {
        let EngineBuilder {
            config,
            factory,
            log_sink,
            supervisor,
            optimizer,
            on_stop,
        } = self;
        config.validate()?;

        let mut mapper = StateMapper::new(factory.as_ref(), &config.state_mapper)?;
        if let Some(path) = &config.state_mapper.model_path {
            if path.exists() {
                mapper.import_json(path)?;
            } else {
                info!(path = %path.display(), "no saved state model, starting empty");
            }
        }
        let exclusion = ExclusionEngine::new(factory.as_ref(), &config.fuzzing.excludes)?;
        info!(rules = exclusion.rules().len(), "exclusion rules loaded");

        let individual_len = mapper.graph().total_layers() as usize;
        let mut fuzzing = config.fuzzing.clone();
        if fuzzing.enable_optimization && individual_len == 0 {
            warn!("state model is empty, optimization disabled");
            fuzzing.enable_optimization = false;
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let mut fitness = FitnessEngine::new(&fuzzing, individual_len);
        if let Some(optimizer) = optimizer {
            fitness = fitness.with_optimizer(optimizer);
        }
        {
            let stop_requested = Arc::clone(&stop_requested);
            let sink = Arc::clone(&log_sink);
            fitness.on_stop(move |reason| {
                stop_requested.store(true, Ordering::Release);
                sink.write(&format!("campaign stopped: {reason:?}"), false);
                if let Some(cb) = &on_stop {
                    cb(reason);
                }
            });
        }
        fitness.start()?;
        let fitness = Arc::new(fitness);

        let mapper = Arc::new(Mutex::new(mapper));
        let mutation = Arc::new(MutationEngine::new(
            MutationSettings::from(&config.fuzzing),
            fitness.probabilities(),
        ));
        let duplication = if config.fuzzing.enable_duplication {
            Some(Arc::new(DuplicationScheduler::start(
                DuplicationSettings::from(&config.fuzzing),
            )?))
        } else {
            None
        };

        let control = ChannelControl::new();
        if let Some(supervisor) = &supervisor {
            let sink = Arc::clone(&log_sink);
            let control = control.clone();
            supervisor.on_exit(Box::new(move |code| {
                warn!(?code, "target exited");
                sink.write(&format!("target exited ({code:?})"), true);
                control.target_restarted();
            }));
        }

        let watchdog = if config.watchdog.enabled {
            let mut builder = Watchdog::builder(Duration::from_millis(config.watchdog.timeout_ms));
            if let Some(supervisor) = &supervisor {
                builder = builder.with_supervisor_restart(Arc::clone(supervisor));
            }
            let mapper = Arc::clone(&mapper);
            let sink = Arc::clone(&log_sink);
            let control = supervisor.is_some().then(|| control.clone());
            builder = builder.callback(move |status| {
                sink.write(
                    &format!("global timeout ({} in a row)", status.timeout_counter),
                    true,
                );
                mapper.lock().go_to_initial_state();
                if let Some(control) = &control {
                    control.target_restarted();
                }
                true
            });
            Some(Arc::new(builder.start()?))
        } else {
            None
        };

        let stats = Arc::new(EngineStats::default());
        let consumer = EventConsumer {
            mapper: Arc::clone(&mapper),
            fitness: Arc::clone(&fitness),
            stats: Arc::clone(&stats),
            watchdog: watchdog.clone(),
            sink: Arc::clone(&log_sink),
            trigger: config.fuzzing.iteration_trigger.clone(),
            rearm: config.fuzzing.iteration_rearm.clone(),
            armed: true,
        };

        Ok(FuzzingEngine {
            shared: SharedComponents {
                mapper,
                exclusion: Arc::new(exclusion),
                mutation,
                duplication,
            },
            config,
            factory,
            fitness,
            consumer: Arc::new(Mutex::new(consumer)),
            stats,
            watchdog,
            log_sink,
            control,
            stop_requested,
            queues: Vec::new(),
            channel_threads: Vec::new(),
            consumer_thread: None,
            shut_down: false,
        })
    }

    /// Build the engine and start servicing every transport channel.
    pub fn start(self) -> Result<FuzzingEngine, EngineError> {
        let mut engine = self.build()?;
        engine.start_channels()?;
        Ok(engine)
    }
}

/// Consumer-side handling of packet events.
struct EventConsumer {
    mapper: Arc<Mutex<StateMapper>>,
    fitness: Arc<FitnessEngine>,
    stats: Arc<EngineStats>,
    watchdog: Option<Arc<Watchdog>>,
    sink: Arc<dyn LogSink>,
    trigger: Option<String>,
    rearm: Option<String>,
    armed: bool,
}

impl EventConsumer {
    fn handle(&mut self, event: &PacketEvent) {
        self.stats.record(event);
        self.sink.write(&event.to_string(), false);
        if let Some(reason) = event.loop_detected {
            warn!(channel = event.channel, ?reason, "target looping");
            self.sink.write(&format!("loop detected: {reason:?}"), true);
        }

        match event.direction {
            Direction::Rx => {
                if let Some(watchdog) = &self.watchdog {
                    watchdog.restart_timeout();
                }
                let ends_iteration = self.armed
                    && self
                        .trigger
                        .as_deref()
                        .is_some_and(|t| event.summary.contains(t));
                if ends_iteration {
                    self.end_iteration();
                }
            }
            Direction::Tx => {
                if let Some(rearm) = self.rearm.as_deref() {
                    if event.summary.contains(rearm) {
                        self.armed = true;
                    }
                }
            }
        }
    }

    fn end_iteration(&mut self) {
        // Without a rearm marker every trigger ends an iteration.
        self.armed = self.rearm.is_none();
        let known = self.mapper.lock().known_transitions();
        match self.fitness.iteration(known as f64) {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "fitness iteration failed"),
        }
        self.mapper.lock().reset_stats();
        debug!(fitness = known, "campaign iteration ended");
    }
}

pub struct FuzzingEngine {
    config: FuzzerConfig,
    factory: Arc<dyn DissectorFactory>,
    shared: SharedComponents,
    fitness: Arc<FitnessEngine>,
    consumer: Arc<Mutex<EventConsumer>>,
    stats: Arc<EngineStats>,
    watchdog: Option<Arc<Watchdog>>,
    log_sink: Arc<dyn LogSink>,
    control: ChannelControl,
    stop_requested: Arc<AtomicBool>,
    queues: Vec<MessageQueue>,
    channel_threads: Vec<JoinHandle<()>>,
    consumer_thread: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl std::fmt::Debug for FuzzingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuzzingEngine")
            .field("channels", &self.channel_threads.len())
            .field("stats", &self.stats.snapshot())
            .field("fitness", &self.fitness)
            .finish_non_exhaustive()
    }
}

impl FuzzingEngine {
    pub fn builder(config: FuzzerConfig, factory: Arc<dyn DissectorFactory>) -> EngineBuilder {
        EngineBuilder::new(config, factory)
    }

    pub fn config(&self) -> &FuzzerConfig {
        &self.config
    }

    pub fn mapper(&self) -> Arc<Mutex<StateMapper>> {
        Arc::clone(&self.shared.mapper)
    }

    pub fn fitness(&self) -> &Arc<FitnessEngine> {
        &self.fitness
    }

    pub fn duplication(&self) -> Option<&Arc<DuplicationScheduler>> {
        self.shared.duplication.as_ref()
    }

    pub fn watchdog(&self) -> Option<&Arc<Watchdog>> {
        self.watchdog.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// A campaign stop condition has been reached.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// A processor wired to the shared components, seeded for `channel`.
    pub fn processor(&self, channel: u8) -> PacketProcessor {
        PacketProcessor::new(
            channel,
            self.factory.as_ref(),
            self.shared.clone(),
            self.fitness.session().random_seed,
        )
    }

    /// Run consumer-side handling for one event.
    pub fn handle_event(&self, event: &PacketEvent) {
        self.consumer.lock().handle(event);
    }

    /// Open the transport and spawn one thread per channel plus the event consumer.
    ///
    /// Every channel and side-channel queue is opened before any thread starts.
    pub fn start_channels(&mut self) -> Result<(), EngineError> {
        let transport = &self.config.transport;
        let rendezvous = Rendezvous::open(transport, Role::Server)?;
        let channels = (0..rendezvous.channel_count())
            .map(|id| rendezvous.channel(id))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(scheduler) = &self.shared.duplication {
            for id in 0..rendezvous.channel_count() {
                let queue = MessageQueue::open(transport, id)?;
                let sink: Arc<dyn DuplicateSink> = Arc::new(queue.sender());
                scheduler.register_sink(id, sink);
                self.queues.push(queue);
            }
        }

        let (events_tx, events_rx) = channel::unbounded::<PacketEvent>();
        let consumer = Arc::clone(&self.consumer);
        self.consumer_thread = Some(
            std::thread::Builder::new()
                .name("event-consumer".into())
                .spawn(move || {
                    for event in events_rx.iter() {
                        consumer.lock().handle(&event);
                    }
                    debug!("event consumer stopped");
                })?,
        );

        for channel in channels {
            let id = channel.id();
            let processor = self.processor(id);
            let thread = spawn_channel(
                id,
                channel,
                processor,
                events_tx.clone(),
                Arc::clone(&self.stats),
                self.control.clone(),
                Arc::clone(&self.log_sink),
            )?;
            self.channel_threads.push(thread);
        }
        info!(channels = self.channel_threads.len(), "fuzzing engine running");
        Ok(())
    }

    /// Stop the engine and persist the session and state model.
    ///
    /// Channel threads blocked in `wait` without a timeout are left behind;
    /// they end when the target goes away.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.control.stop();
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }

        let threads = std::mem::take(&mut self.channel_threads);
        if self.config.transport.timeout_ms.is_some() {
            for handle in threads {
                if handle.join().is_err() {
                    error!("channel thread panicked");
                }
            }
            if let Some(handle) = self.consumer_thread.take() {
                if handle.join().is_err() {
                    error!("event consumer panicked");
                }
            }
        } else if !threads.is_empty() {
            info!(channels = threads.len(), "channel threads detached");
        }

        if let Some(scheduler) = &self.shared.duplication {
            scheduler.shutdown();
        }
        self.fitness.shutdown();

        if let Some(path) = &self.config.state_mapper.model_path {
            match self.shared.mapper.lock().export_json(path) {
                Ok(()) => info!(path = %path.display(), "state model saved"),
                Err(e) => warn!(error = %e, "state model save failed"),
            }
        }
        info!(stats = ?self.stats.snapshot(), "fuzzing engine stopped");
    }
}

fn spawn_channel(
    id: u8,
    channel: wdfuzz_shm::Channel,
    processor: PacketProcessor,
    events: Sender<PacketEvent>,
    stats: Arc<EngineStats>,
    control: ChannelControl,
    sink: Arc<dyn LogSink>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("channel-{id}"))
        .spawn(move || run_channel(channel, processor, events, stats, control, sink))
}

impl Drop for FuzzingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

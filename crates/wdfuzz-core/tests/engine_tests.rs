use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wdfuzz_core::{
    ConfigError, EngineError, FuzzerConfig, FuzzingEngine, LogSink, PacketEvent, PacketProcessor,
    Supervisor, SupervisorError,
};
use wdfuzz_explore::StopReason;
use wdfuzz_model::testing::{mock_packet, MockDissectorFactory};
use wdfuzz_model::{
    Direction, ExcludeRuleConfig, FieldSelector, MappingRuleConfig, ModelError,
};
use wdfuzz_shm::{FrameFlags, FrameMut, PacketFrame, Rendezvous, Role, TransportError};

#[derive(Default)]
struct Lines(Mutex<Vec<(String, bool)>>);

impl LogSink for Lines {
    fn write(&self, msg: &str, is_error: bool) {
        self.0.lock().push((msg.to_string(), is_error));
    }
}

impl Lines {
    fn contains(&self, needle: &str) -> bool {
        self.0.lock().iter().any(|(line, _)| line.contains(needle))
    }
}

#[derive(Default)]
struct MockSupervisor {
    starts: AtomicUsize,
    exit: Mutex<Option<Box<dyn Fn(Option<i32>) + Send + Sync>>>,
}

impl Supervisor for MockSupervisor {
    fn start(&self) -> Result<(), SupervisorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), SupervisorError> {
        Ok(())
    }

    fn on_exit(&self, callback: Box<dyn Fn(Option<i32>) + Send + Sync>) {
        *self.exit.lock() = Some(callback);
    }
}

fn base_config() -> FuzzerConfig {
    let mut config = FuzzerConfig::default();
    config.state_mapper.mapping = vec![MappingRuleConfig {
        layer_name: "RRC".into(),
        filter: "layer==RRC_SETUP".into(),
        state_name_field: FieldSelector::One("rrc.type".into()),
        append_summary: false,
    }];
    config.fuzzing.enable_mutation = false;
    config.watchdog.enabled = false;
    config
}

fn build(config: FuzzerConfig) -> FuzzingEngine {
    FuzzingEngine::builder(config, Arc::new(MockDissectorFactory::new()))
        .build()
        .unwrap()
}

fn rrc(kind: &str, info: &str) -> Vec<u8> {
    mock_packet(&[("layer", "RRC_SETUP"), ("rrc.type", kind), ("info", info)])
}

fn feed(
    processor: &mut PacketProcessor,
    packet: &[u8],
    flags: FrameFlags,
    correlation_id: Option<u64>,
) -> PacketEvent {
    let mut buf = packet.to_vec();
    let mut frame = FrameMut {
        event_type: 1,
        flags,
        payload: &mut buf,
        correlation_id,
    };
    processor.process(&mut frame)
}

fn wait_for(cond: impl Fn() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_rrc_setup_then_release_maps_states() {
    let engine = build(base_config());
    let mut processor = engine.processor(0);

    let setup = feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::empty(), None);
    assert_eq!(setup.direction, Direction::Rx);
    assert_eq!(setup.state.as_deref(), Some("RX / RRC / setup"));
    assert_eq!(setup.summary, "RRC Setup");
    assert!(!setup.new_transition);

    let release = feed(&mut processor, &rrc("release", "RRC Release"), FrameFlags::empty(), None);
    assert_eq!(release.state.as_deref(), Some("RX / RRC / release"));
    assert!(release.new_transition);
    assert_eq!(release.sequence, 1);

    let mapper = engine.mapper();
    let mapper = mapper.lock();
    assert_eq!(mapper.unique_transitions(), 1);
    assert_eq!(mapper.known_transitions(), 1);
}

#[test]
fn test_tx_mutation_keeps_original_for_duplication() {
    let mut config = base_config();
    config.fuzzing.enable_mutation = true;
    config.fuzzing.default_mutation_probability = 1.0;
    config.fuzzing.default_mutation_field_probability = 1.0;
    config.fuzzing.max_fields_mutation = 0;
    config.fuzzing.enable_duplication = true;
    config.fuzzing.default_duplication_probability = 1.0;
    let engine = build(config);
    let mut processor = engine.processor(0);

    let packet = rrc("setup", "RRC Setup");
    let event = feed(&mut processor, &packet, FrameFlags::INTERCEPT_TX, None);
    assert_eq!(event.direction, Direction::Tx);
    assert!(event.fuzzed);
    assert_eq!(event.fields_mutated, 3);
    assert_eq!(event.original.as_deref(), Some(packet.as_slice()));
    assert_eq!(event.buffer.len(), packet.len());
    assert_eq!(&event.buffer[..6], b"layer=");
    // Classification ran on the packet as intercepted.
    assert_eq!(event.state.as_deref(), Some("TX / RRC / setup"));
    assert!(event.duplicate_scheduled.is_some());
}

#[test]
fn test_unmutated_tx_is_duplicated() {
    let mut config = base_config();
    config.fuzzing.enable_duplication = true;
    config.fuzzing.default_duplication_probability = 1.0;
    config.fuzzing.max_duplication_time_ms = 5;
    let engine = build(config);
    let mut processor = engine.processor(3);

    let tx = feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::INTERCEPT_TX, None);
    assert!(!tx.fuzzed);
    assert!(tx.original.is_none());
    assert!(tx.duplicate_scheduled.is_some());

    let rx = feed(&mut processor, &rrc("release", "RRC Release"), FrameFlags::empty(), None);
    assert!(rx.duplicate_scheduled.is_none());

    // No side channel is registered, so the delivery is counted as failed.
    let scheduler = Arc::clone(engine.duplication().unwrap());
    assert!(wait_for(|| scheduler.pending() == 0, Duration::from_secs(5)));
    assert_eq!(scheduler.failed(), 1);
}

#[test]
fn test_duplicate_frames_skip_mapping_and_mutation() {
    let mut config = base_config();
    config.fuzzing.enable_mutation = true;
    config.fuzzing.default_mutation_probability = 1.0;
    config.fuzzing.default_mutation_field_probability = 1.0;
    let engine = build(config);
    let mut processor = engine.processor(0);

    feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::empty(), None);
    let packet = rrc("release", "RRC Release");
    let dup = feed(
        &mut processor,
        &packet,
        FrameFlags::INTERCEPT_TX | FrameFlags::DUPLICATED,
        Some(42),
    );
    assert!(dup.duplicated);
    assert_eq!(dup.duplicate_of, Some(42));
    assert!(!dup.fuzzed);
    assert_eq!(dup.buffer, packet);
    assert_eq!(dup.state.as_deref(), Some("RX / RRC / setup"));
    assert_eq!(engine.mapper().lock().known_transitions(), 0);
}

#[test]
fn test_exclusion_rules_gate_mapping_and_mutation() {
    let mut config = base_config();
    config.fuzzing.enable_mutation = true;
    config.fuzzing.default_mutation_probability = 1.0;
    config.fuzzing.default_mutation_field_probability = 1.0;
    config.fuzzing.excludes = vec![
        ExcludeRuleConfig {
            description: "keep setup intact".into(),
            filter: "rrc.type==setup".into(),
            apply_to: "M".into(),
        },
        ExcludeRuleConfig {
            description: String::new(),
            filter: "rrc.type==release".into(),
            apply_to: "S".into(),
        },
    ];
    let engine = build(config);
    let mut processor = engine.processor(0);

    let setup = feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::INTERCEPT_TX, None);
    assert!(!setup.fuzzed);
    assert_eq!(setup.state.as_deref(), Some("TX / RRC / setup"));

    let release = feed(&mut processor, &rrc("release", "RRC Release"), FrameFlags::empty(), None);
    assert_eq!(release.state.as_deref(), Some("TX / RRC / setup"));
    assert_eq!(engine.mapper().lock().graph().state_count(), 1);
}

#[test]
fn test_campaign_iterations_follow_trigger_and_rearm() {
    let mut config = base_config();
    config.fuzzing.iteration_trigger = Some("RRC Release".into());
    config.fuzzing.iteration_rearm = Some("RRC Setup".into());
    config.fuzzing.max_iterations = 2;
    let lines = Arc::new(Lines::default());
    let stops = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&stops);
    let engine = FuzzingEngine::builder(config, Arc::new(MockDissectorFactory::new()))
        .log_sink(lines.clone())
        .on_stop(move |reason| {
            assert_eq!(reason, StopReason::MaxIterations);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let mut processor = engine.processor(0);
    let mut step = |packet: Vec<u8>, flags: FrameFlags| {
        let event = feed(&mut processor, &packet, flags, None);
        engine.handle_event(&event);
    };

    step(rrc("setup", "RRC Setup"), FrameFlags::empty());
    step(rrc("release", "RRC Release"), FrameFlags::empty());
    assert_eq!(engine.fitness().iterations(), 1);
    assert_eq!(engine.fitness().current_fitness(), 1.0);
    assert_eq!(engine.mapper().lock().known_transitions(), 0);

    // Disarmed until a setup goes out.
    step(rrc("release", "RRC Release"), FrameFlags::empty());
    assert_eq!(engine.fitness().iterations(), 1);

    step(rrc("setup", "RRC Setup"), FrameFlags::INTERCEPT_TX);
    step(rrc("release", "RRC Release"), FrameFlags::empty());
    assert_eq!(engine.fitness().iterations(), 2);
    assert_eq!(engine.fitness().current_fitness(), 2.0);

    assert!(engine.stop_requested());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(lines.contains("campaign stopped: MaxIterations"));
    assert!(lines.contains("RX <-- RRC Release"));

    let stats = engine.stats();
    assert_eq!(stats.packets_rx, 4);
    assert_eq!(stats.packets_tx, 1);
}

#[test]
fn test_bad_filter_is_fatal() {
    let mut config = base_config();
    config.state_mapper.mapping[0].filter = "a and (b)".into();
    let result = FuzzingEngine::builder(config, Arc::new(MockDissectorFactory::new())).build();
    assert!(matches!(
        result,
        Err(EngineError::Model(ModelError::FilterCompile { .. }))
    ));
}

#[test]
fn test_invalid_config_is_fatal() {
    let mut config = base_config();
    config.transport.max_channels = 0;
    let result = FuzzingEngine::builder(config, Arc::new(MockDissectorFactory::new())).build();
    assert!(matches!(
        result,
        Err(EngineError::Config(ConfigError::Invalid(_)))
    ));
}

#[test]
fn test_learned_model_sizes_the_optimizer_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config();
    config.state_mapper.model_path = Some(dir.path().join("model.json"));
    config.fuzzing.enable_optimization = true;
    config.fuzzing.population_size = 2;
    config.fuzzing.generations = 2;
    config.fuzzing.session_path = dir.path().join("session.cbor.gz");

    let mut first = build(config.clone());
    // Nothing learned yet.
    assert!(!first.fitness().is_optimizing());
    let mut processor = first.processor(0);
    feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::INTERCEPT_TX, None);
    feed(&mut processor, &rrc("release", "RRC Release"), FrameFlags::empty(), None);
    let total_layers = first.mapper().lock().graph().total_layers() as usize;
    first.shutdown();

    let mut second = build(config);
    assert_eq!(second.mapper().lock().graph().state_count(), 2);
    assert_eq!(second.mapper().lock().unique_transitions(), 1);
    assert!(second.fitness().is_optimizing());
    assert_eq!(second.fitness().individual_len(), total_layers);
    assert_eq!(second.fitness().individual().len(), total_layers);
    second.shutdown();
}

#[test]
fn test_watchdog_restarts_target_through_supervisor() {
    let mut config = base_config();
    config.watchdog.enabled = true;
    config.watchdog.timeout_ms = 20;
    let supervisor = Arc::new(MockSupervisor::default());
    let lines = Arc::new(Lines::default());
    let mut engine = FuzzingEngine::builder(config, Arc::new(MockDissectorFactory::new()))
        .supervisor(supervisor.clone())
        .log_sink(lines.clone())
        .build()
        .unwrap();
    let mut processor = engine.processor(0);
    feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::empty(), None);

    assert!(wait_for(
        || supervisor.starts.load(Ordering::SeqCst) >= 1,
        Duration::from_secs(5)
    ));
    let watchdog = Arc::clone(engine.watchdog().unwrap());
    assert!(watchdog.total_timeouts() >= 1);
    // The restart resolves the timeout and the model still goes back to its start.
    let mapper = engine.mapper();
    assert!(wait_for(
        || mapper.lock().current_state_name().is_none(),
        Duration::from_secs(5)
    ));
    assert!(lines.contains("global timeout"));

    let exit = supervisor.exit.lock().take().expect("exit callback registered");
    exit(Some(1));
    assert!(lines.contains("target exited"));
    engine.shutdown();
}

#[test]
fn test_watchdog_returns_model_to_initial_state() {
    let mut config = base_config();
    config.watchdog.enabled = true;
    config.watchdog.timeout_ms = 20;
    let lines = Arc::new(Lines::default());
    let engine = FuzzingEngine::builder(config, Arc::new(MockDissectorFactory::new()))
        .log_sink(lines.clone())
        .build()
        .unwrap();
    let mut processor = engine.processor(0);
    feed(&mut processor, &rrc("setup", "RRC Setup"), FrameFlags::empty(), None);

    let mapper = engine.mapper();
    assert!(wait_for(
        || mapper.lock().current_state_name().is_none(),
        Duration::from_secs(5)
    ));
    assert!(lines.contains("global timeout"));
}

#[test]
fn test_channel_thread_mutates_intercepted_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config();
    config.transport.key_path = dir.path().join("segment.key");
    config.transport.max_channels = 2;
    config.transport.buffer_size = 512;
    config.transport.timeout_ms = Some(1_000);
    config.transport.mq_name = format!("/wdfuzz_engine_{}", std::process::id());
    config.fuzzing.enable_mutation = true;
    config.fuzzing.default_mutation_probability = 1.0;
    config.fuzzing.default_mutation_field_probability = 1.0;

    let mut engine =
        match FuzzingEngine::builder(config.clone(), Arc::new(MockDissectorFactory::new())).start() {
            Ok(engine) => engine,
            Err(EngineError::Transport(TransportError::Os { op, source })) => {
                eprintln!("skipping: {op} unavailable ({source})");
                return;
            }
            Err(e) => panic!("unexpected error: {e}"),
        };

    let client = Rendezvous::open(&config.transport, Role::Client).unwrap();
    let mut channel = client.channel(1).unwrap();
    channel.set_timeout(Some(Duration::from_secs(5)));
    let packet = rrc("setup", "RRC Setup");
    channel
        .send(&PacketFrame {
            event_type: 2,
            flags: FrameFlags::INTERCEPT_TX,
            payload: packet.clone(),
            correlation_id: 7,
        })
        .unwrap();
    channel.wait().unwrap();
    let released = channel.frame().unwrap().payload.to_vec();
    assert_eq!(released.len(), packet.len());
    assert_eq!(&released[..6], b"layer=");
    assert_ne!(released, packet);

    assert!(wait_for(|| engine.stats().packets_tx == 1, Duration::from_secs(5)));
    assert_eq!(engine.stats().fuzzed, 1);
    engine.shutdown();
    client.segment().remove().unwrap();
}

#[test]
fn test_packet_arriving_after_channel_timeouts_is_serviced() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config();
    config.transport.key_path = dir.path().join("segment.key");
    config.transport.max_channels = 1;
    config.transport.buffer_size = 512;
    config.transport.timeout_ms = Some(10);
    config.transport.mq_name = format!("/wdfuzz_idle_{}", std::process::id());

    let mut engine =
        match FuzzingEngine::builder(config.clone(), Arc::new(MockDissectorFactory::new())).start() {
            Ok(engine) => engine,
            Err(EngineError::Transport(TransportError::Os { op, source })) => {
                eprintln!("skipping: {op} unavailable ({source})");
                return;
            }
            Err(e) => panic!("unexpected error: {e}"),
        };
    assert!(wait_for(|| engine.stats().timeouts >= 3, Duration::from_secs(5)));

    let client = Rendezvous::open(&config.transport, Role::Client).unwrap();
    let mut channel = client.channel(0).unwrap();
    channel.set_timeout(Some(Duration::from_secs(5)));
    for _ in 0..20 {
        let packet = rrc("setup", "RRC Setup");
        channel
            .send(&PacketFrame {
                event_type: 1,
                flags: FrameFlags::empty(),
                payload: packet.clone(),
                correlation_id: 0,
            })
            .unwrap();
        channel.wait().unwrap();
        assert_eq!(channel.frame().unwrap().payload.to_vec(), packet);
        std::thread::sleep(Duration::from_millis(3));
    }

    assert!(wait_for(|| engine.stats().packets_rx == 20, Duration::from_secs(5)));
    engine.shutdown();
    client.segment().remove().unwrap();
}

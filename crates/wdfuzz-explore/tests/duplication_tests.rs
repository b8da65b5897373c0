use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use wdfuzz_explore::{Duplicate, DuplicateSink, DuplicationScheduler, DuplicationSettings};
use wdfuzz_model::ExcludeMask;
use wdfuzz_shm::TransportError;

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<(Duplicate, Instant)>>,
}

impl DuplicateSink for Recorder {
    fn deliver(&self, duplicate: &Duplicate) -> Result<(), TransportError> {
        self.delivered.lock().push((duplicate.clone(), Instant::now()));
        Ok(())
    }
}

fn settings(max_delay_ms: u64, max_pending: usize) -> DuplicationSettings {
    DuplicationSettings {
        enabled: true,
        probability: 1.0,
        max_delay_ms,
        max_pending,
    }
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
fn test_delays_within_bounds_and_delivered_after_delay() {
    let scheduler = DuplicationScheduler::start(settings(40, 30)).unwrap();
    let sink = Arc::new(Recorder::default());
    scheduler.register_sink(2, sink.clone());
    let mut rng = ChaCha8Rng::seed_from_u64(5);

    let mut tickets = Vec::new();
    for seq in 0..20u64 {
        let scheduled_at = Instant::now();
        let ticket = scheduler
            .packet_duplication(&mut rng, 2, &[seq as u8, 0xAA], seq, ExcludeMask::empty())
            .expect("probability 1 always duplicates");
        assert!(ticket.delay >= Duration::from_millis(1));
        assert!(ticket.delay <= Duration::from_millis(40));
        tickets.push((ticket, scheduled_at));
    }

    // The pending count drops last, after the sink has run.
    assert!(wait_for(|| scheduler.pending() == 0, Duration::from_secs(5)));
    assert_eq!(scheduler.delivered(), 20);
    assert_eq!(sink.delivered.lock().len(), 20);

    let delivered = sink.delivered.lock();
    for (ticket, scheduled_at) in &tickets {
        let (dup, fired_at) = delivered
            .iter()
            .find(|(d, _)| d.id == ticket.id)
            .expect("every ticket is delivered");
        assert_eq!(dup.channel, 2);
        assert_eq!(dup.payload[1], 0xAA);
        assert_eq!(dup.payload[0] as u64, dup.correlation_id);
        assert!(fired_at.duration_since(*scheduled_at) >= ticket.delay);
    }
}

#[test]
fn test_pending_never_exceeds_cap() {
    let scheduler = DuplicationScheduler::start(settings(200, 5)).unwrap();
    scheduler.register_sink(0, Arc::new(Recorder::default()));
    let mut rng = ChaCha8Rng::seed_from_u64(6);

    let accepted = (0..100u64)
        .filter(|seq| {
            let ok = scheduler
                .packet_duplication(&mut rng, 0, b"pkt", *seq, ExcludeMask::empty())
                .is_some();
            assert!(scheduler.pending() <= 5);
            ok
        })
        .count();
    // Anything past the first five is refused until earlier duplicates fire.
    assert!(accepted >= 5);
    assert!(accepted < 100);

    // Slots free up once the duplicates are delivered.
    assert!(wait_for(|| scheduler.pending() == 0, Duration::from_secs(5)));
    assert!(scheduler
        .packet_duplication(&mut rng, 0, b"pkt", 100, ExcludeMask::empty())
        .is_some());
}

#[test]
fn test_exclusion_and_disabled_skip_duplication() {
    let scheduler = DuplicationScheduler::start(settings(10, 30)).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for mask in [ExcludeMask::DUPLICATION, ExcludeMask::ALL] {
        assert!(scheduler
            .packet_duplication(&mut rng, 0, b"x", 0, mask)
            .is_none());
    }

    let disabled = DuplicationScheduler::start(DuplicationSettings {
        enabled: false,
        ..settings(10, 30)
    })
    .unwrap();
    assert!(disabled
        .packet_duplication(&mut rng, 0, b"x", 0, ExcludeMask::empty())
        .is_none());
}

#[test]
fn test_missing_sink_counts_failure() {
    let scheduler = DuplicationScheduler::start(settings(5, 30)).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    scheduler
        .packet_duplication(&mut rng, 9, b"x", 0, ExcludeMask::empty())
        .unwrap();
    assert!(wait_for(|| scheduler.pending() == 0, Duration::from_secs(5)));
    assert_eq!(scheduler.failed(), 1);
    assert_eq!(scheduler.delivered(), 0);
}

//! Global watchdog: a restartable interval timer on a private thread.
//!
//! On every firing the mandatory handlers run in registration order until
//! one reports that it resolved the timeout, which clears the timeout
//! counter. Every optional callback then runs regardless, and the timer
//! rearms when any of them asks to (or when there are none).
//! [`Watchdog::restart_timeout`] only restarts the countdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collab::Supervisor;

/// Counters handed to every handler when the watchdog fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogStatus {
    /// Firings since a handler last resolved a timeout.
    pub timeout_counter: u64,
    /// Every firing since start.
    pub total_timeouts: u64,
}

type Handler = Box<dyn FnMut(&WatchdogStatus) -> bool + Send>;

enum Command {
    Restart,
    SetTimeout(Duration),
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    timeout: AtomicU64,
    total: AtomicU64,
}

pub struct WatchdogBuilder {
    timeout: Duration,
    mandatory: Vec<Handler>,
    callbacks: Vec<Handler>,
}

impl WatchdogBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            mandatory: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Add a handler that returns true when it resolved the timeout.
    pub fn mandatory(mut self, handler: impl FnMut(&WatchdogStatus) -> bool + Send + 'static) -> Self {
        self.mandatory.push(Box::new(handler));
        self
    }

    /// Add an optional callback. Returning true asks for the timer to rearm.
    pub fn callback(mut self, callback: impl FnMut(&WatchdogStatus) -> bool + Send + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Restart the target on every firing; a successful restart resolves it.
    pub fn with_supervisor_restart(self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.mandatory(move |status| match supervisor.restart() {
            Ok(()) => {
                info!(timeouts = status.timeout_counter, "target restarted by watchdog");
                true
            }
            Err(e) => {
                warn!(error = %e, "watchdog could not restart the target");
                false
            }
        })
    }

    pub fn start(self) -> std::io::Result<Watchdog> {
        let (tx, rx) = channel::unbounded();
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        let WatchdogBuilder {
            mut timeout,
            mut mandatory,
            mut callbacks,
        } = self;

        let thread = std::thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                let mut armed = true;
                loop {
                    let received = if armed {
                        rx.recv_timeout(timeout)
                    } else {
                        rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
                    };
                    match received {
                        Ok(Command::Restart) => armed = true,
                        Ok(Command::SetTimeout(t)) => {
                            timeout = t;
                            armed = true;
                        }
                        Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            armed = fire(&shared, &mut mandatory, &mut callbacks);
                        }
                    }
                }
                debug!("watchdog stopped");
            })?;

        Ok(Watchdog {
            commands: tx,
            counters,
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn fire(counters: &Counters, mandatory: &mut [Handler], callbacks: &mut [Handler]) -> bool {
    let status = WatchdogStatus {
        timeout_counter: counters.timeout.fetch_add(1, Ordering::AcqRel) + 1,
        total_timeouts: counters.total.fetch_add(1, Ordering::AcqRel) + 1,
    };
    warn!(
        timeouts = status.timeout_counter,
        total = status.total_timeouts,
        "global timeout"
    );

    if let Some(index) = mandatory.iter_mut().position(|handler| handler(&status)) {
        debug!(handler = index, "timeout resolved");
        counters.timeout.store(0, Ordering::Release);
    }
    if callbacks.is_empty() {
        return true;
    }
    callbacks
        .iter_mut()
        .fold(false, |rearm, callback| callback(&status) | rearm)
}

pub struct Watchdog {
    commands: Sender<Command>,
    counters: Arc<Counters>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout_counter", &self.timeout_counter())
            .field("total_timeouts", &self.total_timeouts())
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    pub fn builder(timeout: Duration) -> WatchdogBuilder {
        WatchdogBuilder::new(timeout)
    }

    /// Activity seen: restart the countdown, rearming a disarmed timer.
    pub fn restart_timeout(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        let _ = self.commands.send(Command::SetTimeout(timeout));
    }

    pub fn timeout_counter(&self) -> u64 {
        self.counters.timeout.load(Ordering::Acquire)
    }

    pub fn total_timeouts(&self) -> u64 {
        self.counters.total.load(Ordering::Acquire)
    }

    /// Clear the timeout counter, e.g. once the target reconnects.
    pub fn reset_counter(&self) {
        self.counters.timeout.store(0, Ordering::Release);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(cond: impl Fn() -> bool, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_without_callbacks_it_keeps_firing() {
        let watchdog = Watchdog::builder(Duration::from_millis(10)).start().unwrap();
        assert!(wait_for(|| watchdog.total_timeouts() >= 3, Duration::from_secs(5)));
        assert_eq!(watchdog.timeout_counter(), watchdog.total_timeouts());
        watchdog.reset_counter();
        assert!(watchdog.timeout_counter() < watchdog.total_timeouts());
        watchdog.stop();
    }

    #[test]
    fn test_callback_declining_disarms_until_restart() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let watchdog = Watchdog::builder(Duration::from_millis(10))
            .callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            })
            .start()
            .unwrap();

        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        watchdog.restart_timeout();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 2, Duration::from_secs(5)));
        watchdog.stop();
    }

    #[test]
    fn test_callbacks_run_after_resolving_handler() {
        let handled = Arc::new(AtomicUsize::new(0));
        let called = Arc::new(AtomicUsize::new(0));
        let skipped = Arc::new(AtomicUsize::new(0));
        let (h, c, s) = (Arc::clone(&handled), Arc::clone(&called), Arc::clone(&skipped));
        let watchdog = Watchdog::builder(Duration::from_millis(10))
            .mandatory(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                true
            })
            .mandatory(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                true
            })
            .callback(move |status| {
                // The counter is reset only after callbacks see this firing.
                assert_eq!(status.timeout_counter, 1);
                c.fetch_add(1, Ordering::SeqCst);
                true
            })
            .start()
            .unwrap();

        assert!(wait_for(|| called.load(Ordering::SeqCst) >= 3, Duration::from_secs(5)));
        watchdog.stop();
        assert_eq!(called.load(Ordering::SeqCst), handled.load(Ordering::SeqCst));
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(watchdog.timeout_counter(), 0);
        assert!(watchdog.total_timeouts() >= 3);
    }
}

//! Cross-process binary signal living inside the shared segment.
//!
//! A signal is a process-shared mutex, condition variable and a counter used
//! as a latched flag: `notify` sets it to 1, a successful `wait` clears it.
//! Several notifies before a wait collapse into one wake-up.

use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::time::Duration;

use tracing::warn;

use crate::error::TransportError;

/// How long `notify` may spend acquiring the peer's mutex.
pub const NOTIFY_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed layout shared with the target process.
#[repr(C)]
pub struct RawSignal {
    mutex: libc::pthread_mutex_t,
    condition: libc::pthread_cond_t,
    count: libc::c_int,
}

pub const SIGNAL_SIZE: usize = std::mem::size_of::<RawSignal>();
pub const SIGNAL_ALIGN: usize = std::mem::align_of::<RawSignal>();

/// Outcome of [`Signal::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
}

/// Handle to a [`RawSignal`] inside a mapped segment.
///
/// The handle does not own the memory; the segment it came from must outlive it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Signal {
    ptr: NonNull<RawSignal>,
}

unsafe impl Send for Signal {}
unsafe impl Sync for Signal {}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = MaybeUninit::<libc::timespec>::zeroed();
    // SAFETY: clock_gettime only writes the provided timespec.
    let now = unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr());
        now.assume_init()
    };
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

impl Signal {
    /// # Safety
    /// `ptr` must point to a suitably aligned `RawSignal` inside a mapping that
    /// stays attached for the lifetime of the returned handle.
    pub(crate) unsafe fn from_raw(ptr: *mut RawSignal) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        // SAFETY: the pointer is valid for the handle's lifetime.
        unsafe { std::ptr::addr_of_mut!((*self.ptr.as_ptr()).mutex) }
    }

    fn condition(&self) -> *mut libc::pthread_cond_t {
        unsafe { std::ptr::addr_of_mut!((*self.ptr.as_ptr()).condition) }
    }

    fn count(&self) -> *mut libc::c_int {
        unsafe { std::ptr::addr_of_mut!((*self.ptr.as_ptr()).count) }
    }

    /// Initialise mutex and condvar with process-shared attributes.
    ///
    /// Only the side that created the segment calls this.
    pub(crate) fn init(&self) -> Result<(), TransportError> {
        unsafe {
            let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();

            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(mattr.as_mut_ptr()))?;
            check("pthread_condattr_init", libc::pthread_condattr_init(cattr.as_mut_ptr()))?;
            check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(mattr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            )?;
            check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(mattr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST),
            )?;
            check(
                "pthread_condattr_setpshared",
                libc::pthread_condattr_setpshared(cattr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            )?;

            check("pthread_mutex_init", libc::pthread_mutex_init(self.mutex(), mattr.as_ptr()))?;
            check("pthread_cond_init", libc::pthread_cond_init(self.condition(), cattr.as_ptr()))?;

            libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
            libc::pthread_condattr_destroy(cattr.as_mut_ptr());
            *self.count() = 0;
        }
        Ok(())
    }

    /// Destroy the pthread objects. Only the creator calls this, on teardown.
    pub(crate) fn destroy(&self) {
        unsafe {
            libc::pthread_cond_destroy(self.condition());
            libc::pthread_mutex_destroy(self.mutex());
        }
    }

    /// A lock result of `EOWNERDEAD` means the previous holder died; we now
    /// own the mutex and mark it consistent.
    fn recover_lock(&self, rc: libc::c_int, op: &'static str) -> Result<(), TransportError> {
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                warn!(op, "signal mutex owner died, recovering");
                unsafe { libc::pthread_mutex_consistent(self.mutex()) };
                Ok(())
            }
            code => Err(TransportError::from_code(op, code)),
        }
    }

    /// Block until notified or until `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, TransportError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex()) };
        self.recover_lock(rc, "pthread_mutex_lock")?;

        let deadline = timeout.map(deadline_after);
        let mut outcome = WaitOutcome::Signalled;
        unsafe {
            while *self.count() == 0 {
                let rc = match &deadline {
                    Some(ts) => libc::pthread_cond_timedwait(self.condition(), self.mutex(), ts),
                    None => libc::pthread_cond_wait(self.condition(), self.mutex()),
                };
                match rc {
                    0 => {}
                    libc::ETIMEDOUT => {
                        outcome = WaitOutcome::TimedOut;
                        break;
                    }
                    libc::EOWNERDEAD => {
                        libc::pthread_mutex_consistent(self.mutex());
                    }
                    code => {
                        libc::pthread_mutex_unlock(self.mutex());
                        return Err(TransportError::from_code("pthread_cond_wait", code));
                    }
                }
            }
            if outcome == WaitOutcome::Signalled {
                *self.count() = 0;
            }
            libc::pthread_mutex_unlock(self.mutex());
        }
        Ok(outcome)
    }

    /// Latch the flag and wake the waiter.
    ///
    /// Returns false if the mutex could not be taken within
    /// [`NOTIFY_LOCK_TIMEOUT`]; the caller carries on instead of hanging on a
    /// vanished peer.
    pub(crate) fn notify(&self) -> bool {
        let deadline = deadline_after(NOTIFY_LOCK_TIMEOUT);
        let rc = unsafe { libc::pthread_mutex_timedlock(self.mutex(), &deadline) };
        if let Err(e) = self.recover_lock(rc, "pthread_mutex_timedlock") {
            warn!(error = %e, "notify could not lock signal mutex");
            return false;
        }
        unsafe {
            *self.count() = 1;
            libc::pthread_cond_signal(self.condition());
            libc::pthread_mutex_unlock(self.mutex());
        }
        true
    }

    /// Release a mutex possibly left locked by a dead peer and clear the flag.
    pub(crate) fn force_reset(&self) {
        unsafe {
            let rc = libc::pthread_mutex_trylock(self.mutex());
            if rc == libc::EOWNERDEAD {
                libc::pthread_mutex_consistent(self.mutex());
            }
            libc::pthread_mutex_unlock(self.mutex());
            *self.count() = 0;
        }
    }

    /// Current latched value, for diagnostics.
    pub(crate) fn is_set(&self) -> bool {
        unsafe { std::ptr::read_volatile(self.count()) != 0 }
    }
}

fn check(op: &'static str, rc: libc::c_int) -> Result<(), TransportError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(TransportError::from_code(op, rc))
    }
}

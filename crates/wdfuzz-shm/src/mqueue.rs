//! POSIX message-queue side channel.
//!
//! One named queue per channel carries fire-and-forget injections (packet
//! duplicates). Every message ends with a `u64` correlation id. Sends never
//! block. Reception is either direct (non-blocking `mq_receive`) or through
//! a pump thread that drains the queue into a [`BipBuffer`] so the consumer
//! can poll without a syscall.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bipbuf::{BipBuffer, BipReader, BipWriter};
use crate::config::ShmConfig;
use crate::error::TransportError;
use crate::frame::CORRELATION_TRAILER_LEN;

const RECORD_PREFIX_LEN: usize = 2;
const PUMP_POLL: Duration = Duration::from_millis(100);

/// A message taken off the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqMessage<'a> {
    pub payload: &'a [u8],
    pub correlation_id: u64,
}

impl<'a> MqMessage<'a> {
    fn split(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < CORRELATION_TRAILER_LEN {
            return None;
        }
        let (payload, trailer) = raw.split_at(raw.len() - CORRELATION_TRAILER_LEN);
        let mut id = [0u8; CORRELATION_TRAILER_LEN];
        id.copy_from_slice(trailer);
        Some(Self {
            payload,
            correlation_id: u64::from_ne_bytes(id),
        })
    }
}

/// Queue name for a channel: the last path component of `base`, suffixed with the channel.
pub fn queue_name(base: &str, channel: u8) -> String {
    let stem = base.rsplit('/').find(|s| !s.is_empty()).unwrap_or("wshm");
    format!("/{stem}_{channel}")
}

#[derive(Debug)]
struct MqHandle {
    mqd: libc::mqd_t,
}

impl Drop for MqHandle {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

fn raise_queue_rlimit(bytes: u64) {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        if libc::getrlimit(libc::RLIMIT_MSGQUEUE, &mut lim) != 0 {
            return;
        }
        let want = bytes as libc::rlim_t;
        if lim.rlim_cur >= want && lim.rlim_max >= want {
            return;
        }
        lim.rlim_cur = lim.rlim_cur.max(want);
        lim.rlim_max = lim.rlim_max.max(want);
        if libc::setrlimit(libc::RLIMIT_MSGQUEUE, &lim) != 0 {
            warn!(bytes, "could not raise RLIMIT_MSGQUEUE");
        }
    }
}

fn open_queue(
    name: &CString,
    nonblocking: bool,
    msg_size: usize,
    depth: usize,
) -> Result<MqHandle, TransportError> {
    let mut flags = libc::O_RDWR | libc::O_CREAT;
    if nonblocking {
        flags |= libc::O_NONBLOCK;
    }
    let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
    attr.mq_maxmsg = depth as _;
    attr.mq_msgsize = msg_size as _;
    let mode: libc::mode_t = 0o666;
    let mqd = unsafe { libc::mq_open(name.as_ptr(), flags, mode, &mut attr as *mut libc::mq_attr) };
    if mqd == -1 {
        return Err(TransportError::last_os("mq_open"));
    }
    Ok(MqHandle { mqd })
}

/// Cloneable, thread-safe sending half.
#[derive(Debug, Clone)]
pub struct MqSender {
    handle: Arc<MqHandle>,
    msg_size: usize,
    channel: u8,
}

impl MqSender {
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Largest payload accepted once the correlation trailer is appended.
    pub fn max_payload(&self) -> usize {
        self.msg_size - CORRELATION_TRAILER_LEN
    }

    /// Enqueue `payload` tagged with `correlation_id`. Fails instead of blocking when full.
    pub fn send(&self, payload: &[u8], correlation_id: u64) -> Result<(), TransportError> {
        if payload.len() > self.max_payload() {
            return Err(TransportError::MessageTooLarge {
                len: payload.len(),
                max: self.max_payload(),
            });
        }
        let mut msg = Vec::with_capacity(payload.len() + CORRELATION_TRAILER_LEN);
        msg.extend_from_slice(payload);
        msg.extend_from_slice(&correlation_id.to_ne_bytes());
        let rc = unsafe {
            libc::mq_send(
                self.handle.mqd,
                msg.as_ptr() as *const libc::c_char,
                msg.len(),
                0,
            )
        };
        if rc == -1 {
            return Err(TransportError::last_os("mq_send"));
        }
        Ok(())
    }
}

enum Receiver {
    Direct {
        buf: Vec<u8>,
    },
    Pumped {
        reader: BipReader,
        pending: usize,
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    },
}

/// Side channel for one transport channel.
pub struct MessageQueue {
    name: String,
    sender: MqSender,
    receiver: Receiver,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("pumped", &matches!(self.receiver, Receiver::Pumped { .. }))
            .finish()
    }
}

impl MessageQueue {
    pub fn open(config: &ShmConfig, channel: u8) -> Result<Self, TransportError> {
        let name = queue_name(&config.mq_name, channel);
        let c_name = CString::new(name.clone()).map_err(|_| TransportError::InvalidLayout {
            details: format!("queue name {name} contains a NUL byte"),
        })?;
        let msg_size = config.buffer_size;
        if msg_size <= CORRELATION_TRAILER_LEN {
            return Err(TransportError::InvalidLayout {
                details: format!("message size {msg_size} cannot hold a correlation id"),
            });
        }
        raise_queue_rlimit((config.mq_depth * msg_size) as u64);

        let send_handle = Arc::new(open_queue(&c_name, true, msg_size, config.mq_depth)?);
        let sender = MqSender {
            handle: Arc::clone(&send_handle),
            msg_size,
            channel,
        };

        let receiver = if config.mq_pump_thread {
            let recv_handle = open_queue(&c_name, false, msg_size, config.mq_depth)?;
            let (writer, reader) =
                BipBuffer::with_capacity((msg_size + RECORD_PREFIX_LEN) * config.mq_depth).split();
            let stop = Arc::new(AtomicBool::new(false));
            let thread = {
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("mq-pump-{channel}"))
                    .spawn(move || pump(recv_handle, msg_size, writer, stop))
                    .map_err(|source| TransportError::Os {
                        op: "spawn mq pump",
                        source,
                    })?
            };
            Receiver::Pumped {
                reader,
                pending: 0,
                stop,
                thread: Some(thread),
            }
        } else {
            Receiver::Direct {
                buf: vec![0u8; msg_size],
            }
        };

        debug!(queue = %name, pumped = config.mq_pump_thread, "opened side channel");
        Ok(Self {
            name,
            sender,
            receiver,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> MqSender {
        self.sender.clone()
    }

    pub fn send(&self, payload: &[u8], correlation_id: u64) -> Result<(), TransportError> {
        self.sender.send(payload, correlation_id)
    }

    /// Take the next message if one is ready. Never blocks.
    ///
    /// The returned message stays valid until the next call.
    pub fn try_recv(&mut self) -> Option<MqMessage<'_>> {
        match &mut self.receiver {
            Receiver::Direct { buf } => {
                let n = unsafe {
                    libc::mq_receive(
                        self.sender.handle.mqd,
                        buf.as_mut_ptr() as *mut libc::c_char,
                        buf.len(),
                        std::ptr::null_mut(),
                    )
                };
                if n <= 0 {
                    return None;
                }
                MqMessage::split(&buf[..n as usize])
            }
            Receiver::Pumped {
                reader, pending, ..
            } => {
                if *pending > 0 {
                    reader.release_read(*pending);
                    *pending = 0;
                }
                let region = reader.acquire_read();
                if region.len() < RECORD_PREFIX_LEN {
                    return None;
                }
                let len = u16::from_ne_bytes([region[0], region[1]]) as usize;
                let end = RECORD_PREFIX_LEN + len;
                if region.len() < end {
                    return None;
                }
                *pending = end;
                MqMessage::split(&region[RECORD_PREFIX_LEN..end])
            }
        }
    }

    /// Remove the queue name from the system. Open descriptors stay usable.
    pub fn unlink(&self) -> Result<(), TransportError> {
        let c_name = CString::new(self.name.clone()).map_err(|_| TransportError::InvalidLayout {
            details: format!("queue name {} contains a NUL byte", self.name),
        })?;
        if unsafe { libc::mq_unlink(c_name.as_ptr()) } == -1 {
            return Err(TransportError::last_os("mq_unlink"));
        }
        Ok(())
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if let Receiver::Pumped { stop, thread, .. } = &mut self.receiver {
            stop.store(true, Ordering::Release);
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
        }
    }
}

fn pump(handle: MqHandle, msg_size: usize, mut writer: BipWriter, stop: Arc<AtomicBool>) {
    let mut buf = vec![0u8; msg_size];
    while !stop.load(Ordering::Acquire) {
        let deadline = {
            let mut now: libc::timespec = unsafe { std::mem::zeroed() };
            unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
            let mut nsec = now.tv_nsec + PUMP_POLL.subsec_nanos() as libc::c_long;
            let mut sec = now.tv_sec;
            if nsec >= 1_000_000_000 {
                sec += 1;
                nsec -= 1_000_000_000;
            }
            libc::timespec {
                tv_sec: sec,
                tv_nsec: nsec,
            }
        };
        let n = unsafe {
            libc::mq_timedreceive(
                handle.mqd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                std::ptr::null_mut(),
                &deadline,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) => {}
                _ => {
                    warn!(error = %err, "mq_timedreceive failed");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            continue;
        }
        let n = n as usize;
        if n == 0 {
            continue;
        }

        let record = RECORD_PREFIX_LEN + n;
        loop {
            if let Some(region) = writer.acquire_write(record) {
                region[..RECORD_PREFIX_LEN].copy_from_slice(&(n as u16).to_ne_bytes());
                region[RECORD_PREFIX_LEN..].copy_from_slice(&buf[..n]);
                writer.release_write(record);
                break;
            }
            if stop.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

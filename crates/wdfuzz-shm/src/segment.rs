//! SysV shared-memory segment holding every channel.
//!
//! ```text
//! [ buffer 0 | buffer 1 | ... | buffer N-1 | client 0 | server 0 | client 1 | server 1 | ... ]
//! ```
//!
//! The key is derived from a file path with `ftok`. The side that creates the
//! segment initialises the signals; a side that finds it already present
//! attaches without touching them.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::signal::{RawSignal, Signal, SIGNAL_ALIGN, SIGNAL_SIZE};

const PAGE_SIZE: usize = 4096;
const CREATE_ATTEMPTS: usize = 3;

/// Geometry of the segment, validated once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    max_channels: usize,
    buffer_size: usize,
}

impl SegmentLayout {
    pub fn new(max_channels: usize, buffer_size: usize) -> Result<Self, TransportError> {
        if max_channels == 0 || max_channels > u8::MAX as usize {
            return Err(TransportError::InvalidLayout {
                details: format!("max_channels {max_channels} must be in 1..=255"),
            });
        }
        if buffer_size == 0 || buffer_size > u16::MAX as usize {
            return Err(TransportError::InvalidLayout {
                details: format!("buffer_size {buffer_size} must fit a u16 frame length"),
            });
        }
        if buffer_size % SIGNAL_ALIGN != 0 {
            return Err(TransportError::InvalidLayout {
                details: format!("buffer_size {buffer_size} must be a multiple of {SIGNAL_ALIGN}"),
            });
        }
        Ok(Self {
            max_channels,
            buffer_size,
        })
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_offset(&self, channel: usize) -> usize {
        channel * self.buffer_size
    }

    fn signal_block_offset(&self) -> usize {
        self.max_channels * self.buffer_size
    }

    pub fn client_signal_offset(&self, channel: usize) -> usize {
        self.signal_block_offset() + (2 * channel) * SIGNAL_SIZE
    }

    pub fn server_signal_offset(&self, channel: usize) -> usize {
        self.signal_block_offset() + (2 * channel + 1) * SIGNAL_SIZE
    }

    /// Exact bytes used by buffers and signals.
    pub fn raw_size(&self) -> usize {
        self.signal_block_offset() + self.max_channels * 2 * SIGNAL_SIZE
    }

    /// Allocation size, rounded up to whole pages.
    pub fn segment_size(&self) -> usize {
        self.raw_size().div_ceil(PAGE_SIZE) * PAGE_SIZE
    }
}

/// Which half of a channel a signal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

/// An attached segment. Detached on drop.
#[derive(Debug)]
pub struct ShmSegment {
    id: libc::c_int,
    base: NonNull<u8>,
    layout: SegmentLayout,
    key_path: PathBuf,
    created: bool,
}

unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn segment_key(path: &Path) -> Result<libc::key_t, TransportError> {
    // ftok needs an existing file.
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TransportError::Os {
            op: "create key file",
            source,
        })?;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        TransportError::InvalidLayout {
            details: format!("key path {} contains a NUL byte", path.display()),
        }
    })?;
    let key = unsafe { libc::ftok(c_path.as_ptr(), b'X' as libc::c_int) };
    if key == -1 {
        return Err(TransportError::last_os("ftok"));
    }
    Ok(key)
}

impl ShmSegment {
    /// Create the segment, or attach to the one already registered under `key_path`.
    pub fn open(key_path: &Path, layout: SegmentLayout) -> Result<Self, TransportError> {
        let key = segment_key(key_path)?;
        let size = layout.segment_size();

        let mut attempt = 0;
        let (id, created) = loop {
            attempt += 1;
            let id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o666) };
            if id >= 0 {
                break (id, true);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(TransportError::Os {
                    op: "shmget",
                    source: err,
                });
            }

            let id = unsafe { libc::shmget(key, size, 0o666) };
            if id >= 0 {
                break (id, false);
            }

            // Present with a different size: remove it and start over.
            if attempt >= CREATE_ATTEMPTS {
                return Err(TransportError::last_os("shmget"));
            }
            let stale = unsafe { libc::shmget(key, 0, 0o666) };
            warn!(segment_id = stale, "shared segment size mismatch, recreating");
            if stale < 0 || unsafe { libc::shmctl(stale, libc::IPC_RMID, std::ptr::null_mut()) } < 0 {
                return Err(TransportError::last_os("shmctl(IPC_RMID)"));
            }
        };

        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(TransportError::last_os("shmat"));
        }
        let base = NonNull::new(addr as *mut u8).ok_or_else(|| TransportError::last_os("shmat"))?;

        let segment = Self {
            id,
            base,
            layout,
            key_path: key_path.to_path_buf(),
            created,
        };

        if created {
            for ch in 0..layout.max_channels() {
                segment.signal(ch, Role::Client).init()?;
                segment.signal(ch, Role::Server).init()?;
            }
            info!(segment_id = id, size, "created shared segment");
        } else {
            debug!(segment_id = id, size, "attached to existing shared segment");
        }
        Ok(segment)
    }

    /// Attach again from scratch, picking up a segment recreated by a restarted peer.
    pub fn reattach(&self) -> Result<Self, TransportError> {
        Self::open(&self.key_path, self.layout)
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    /// True when this process created (and initialised) the segment.
    pub fn created(&self) -> bool {
        self.created
    }

    pub(crate) fn buffer_ptr(&self, channel: usize) -> *mut u8 {
        debug_assert!(channel < self.layout.max_channels());
        unsafe { self.base.as_ptr().add(self.layout.buffer_offset(channel)) }
    }

    pub(crate) fn signal(&self, channel: usize, role: Role) -> Signal {
        let offset = match role {
            Role::Client => self.layout.client_signal_offset(channel),
            Role::Server => self.layout.server_signal_offset(channel),
        };
        // SAFETY: offset is inside the segment and aligned (checked by SegmentLayout::new).
        unsafe {
            let ptr = self.base.as_ptr().add(offset) as *mut RawSignal;
            Signal::from_raw(ptr).unwrap_or_else(|| unreachable!("segment base is non-null"))
        }
    }

    /// Mark the segment for removal once every process has detached.
    pub fn remove(&self) -> Result<(), TransportError> {
        if unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) } < 0 {
            return Err(TransportError::last_os("shmctl(IPC_RMID)"));
        }
        Ok(())
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base.as_ptr() as *const libc::c_void);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let layout = SegmentLayout::new(16, 16384).unwrap();
        assert_eq!(layout.buffer_offset(0), 0);
        assert_eq!(layout.buffer_offset(3), 3 * 16384);
        assert_eq!(layout.client_signal_offset(0), 16 * 16384);
        assert_eq!(layout.server_signal_offset(0), 16 * 16384 + SIGNAL_SIZE);
        assert_eq!(layout.client_signal_offset(2), 16 * 16384 + 4 * SIGNAL_SIZE);
        assert_eq!(layout.raw_size(), 16 * 16384 + 32 * SIGNAL_SIZE);
        assert_eq!(layout.segment_size() % PAGE_SIZE, 0);
        assert!(layout.segment_size() >= layout.raw_size());
    }

    #[test]
    fn test_layout_rejects_bad_geometry() {
        assert!(SegmentLayout::new(0, 16384).is_err());
        assert!(SegmentLayout::new(4, 0).is_err());
        assert!(SegmentLayout::new(4, 100_000).is_err());
        assert!(SegmentLayout::new(4, 1001).is_err());
    }

    #[test]
    fn test_signal_offsets_are_aligned() {
        let layout = SegmentLayout::new(5, 1024).unwrap();
        for ch in 0..5 {
            assert_eq!(layout.client_signal_offset(ch) % SIGNAL_ALIGN, 0);
            assert_eq!(layout.server_signal_offset(ch) % SIGNAL_ALIGN, 0);
        }
    }

    #[test]
    fn test_role_peer() {
        assert_eq!(Role::Server.peer(), Role::Client);
        assert_eq!(Role::Client.peer(), Role::Server);
    }
}

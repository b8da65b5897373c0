//! Rendezvous channels over the shared segment.
//!
//! Each channel pairs a server and a client signal with one buffer. A side
//! writes its frame into the buffer, notifies the peer, then waits on its
//! own signal for the reply. The buffer is only ever written by the side
//! holding the current half of the handshake.
//!
//! All channels of one [`Rendezvous`] share its attachment. When a client
//! reattaches after a timeout, every sibling channel picks up the fresh
//! mapping on its next `wait`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::ShmConfig;
use crate::error::TransportError;
use crate::frame::{FrameCodec, FrameMut, PacketFrame};
use crate::segment::{Role, SegmentLayout, ShmSegment};
use crate::signal::WaitOutcome;

/// The segment currently mapped for one endpoint.
#[derive(Debug)]
struct Attachment {
    current: RwLock<Arc<ShmSegment>>,
}

impl Attachment {
    fn current(&self) -> Arc<ShmSegment> {
        Arc::clone(&self.current.read())
    }

    /// Replace `stale` with a fresh attachment, unless a sibling already did.
    fn reattach(&self, stale: &Arc<ShmSegment>) -> Result<Arc<ShmSegment>, TransportError> {
        let mut current = self.current.write();
        if Arc::ptr_eq(&current, stale) {
            *current = Arc::new(stale.reattach()?);
        }
        Ok(Arc::clone(&current))
    }
}

/// One attached endpoint of the transport, from which channels are handed out.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    attachment: Arc<Attachment>,
    role: Role,
    timeout: Option<Duration>,
    codec: FrameCodec,
}

impl Rendezvous {
    pub fn open(config: &ShmConfig, role: Role) -> Result<Self, TransportError> {
        let layout = SegmentLayout::new(config.max_channels as usize, config.buffer_size)?;
        let segment = ShmSegment::open(&config.key_path, layout)?;
        Ok(Self {
            attachment: Arc::new(Attachment {
                current: RwLock::new(Arc::new(segment)),
            }),
            role,
            timeout: config.timeout(),
            codec: FrameCodec::new(config.time_tagging),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The segment this endpoint is currently attached to.
    pub fn segment(&self) -> Arc<ShmSegment> {
        self.attachment.current()
    }

    pub fn channel_count(&self) -> u8 {
        self.segment().layout().max_channels() as u8
    }

    /// Hand out channel `id`. Each channel must be driven by a single thread.
    pub fn channel(&self, id: u8) -> Result<Channel, TransportError> {
        let segment = self.segment();
        if id as usize >= segment.layout().max_channels() {
            return Err(TransportError::InvalidChannel(id));
        }
        Ok(Channel {
            id,
            role: self.role,
            attachment: Arc::clone(&self.attachment),
            segment,
            timeout: self.timeout,
            codec: self.codec,
        })
    }
}

/// A single numbered channel, owned by the thread that services it.
#[derive(Debug)]
pub struct Channel {
    id: u8,
    role: Role,
    attachment: Arc<Attachment>,
    /// Mapping used for the current handshake; refreshed at every `wait`.
    segment: Arc<ShmSegment>,
    timeout: Option<Duration>,
    codec: FrameCodec,
}

impl Channel {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn capacity(&self) -> usize {
        self.segment.layout().buffer_size()
    }

    /// Id of the segment this channel currently uses.
    pub fn segment_id(&self) -> libc::c_int {
        self.segment.id()
    }

    /// Block until the peer notifies this side.
    ///
    /// A timeout leaves both signals untouched, so a notify landing right
    /// after it is still seen by the next `wait`. A client additionally
    /// reattaches the segment so that a restarted server is found again
    /// without restarting the client.
    pub fn wait(&mut self) -> Result<(), TransportError> {
        let current = self.attachment.current();
        if !Arc::ptr_eq(&current, &self.segment) {
            debug!(channel = self.id, segment_id = current.id(), "switched to fresh segment");
            self.segment = current;
        }
        let signal = self.segment.signal(self.id as usize, self.role);
        match signal.wait(self.timeout)? {
            WaitOutcome::Signalled => Ok(()),
            WaitOutcome::TimedOut => {
                warn!(channel = self.id, role = ?self.role, "timeout waiting for peer");
                if self.role == Role::Client {
                    match self.attachment.reattach(&self.segment) {
                        Ok(fresh) => {
                            debug!(channel = self.id, segment_id = fresh.id(), "client reattached");
                            self.segment = fresh;
                        }
                        Err(e) => warn!(channel = self.id, error = %e, "client reattach failed"),
                    }
                }
                Err(TransportError::Timeout { channel: self.id })
            }
        }
    }

    /// Wake the peer. Never blocks for more than the notify lock timeout.
    pub fn notify(&self) -> bool {
        let signal = self.segment.signal(self.id as usize, self.role.peer());
        let ok = signal.notify();
        if !ok {
            warn!(channel = self.id, "notify dropped, peer mutex unavailable");
        }
        ok
    }

    /// Clear both halves after a peer died mid-handshake.
    ///
    /// Any notify not yet consumed is discarded, so this is only for a peer
    /// known to be gone.
    pub fn resync(&self) {
        let ch = self.id as usize;
        self.segment.signal(ch, Role::Server).force_reset();
        self.segment.signal(ch, Role::Client).force_reset();
        debug!(channel = self.id, "channel resynced");
    }

    /// The raw channel buffer.
    pub fn buffer(&mut self) -> &mut [u8] {
        let len = self.segment.layout().buffer_size();
        // SAFETY: the buffer lies inside the attached segment and the
        // handshake gives this side exclusive use of it between wait and notify.
        unsafe { std::slice::from_raw_parts_mut(self.segment.buffer_ptr(self.id as usize), len) }
    }

    /// Decode the frame the peer left in the buffer.
    pub fn frame(&mut self) -> Result<FrameMut<'_>, TransportError> {
        let codec = self.codec;
        codec.decode_mut(self.buffer())
    }

    /// Encode `frame` into the buffer and notify the peer.
    pub fn send(&mut self, frame: &PacketFrame) -> Result<usize, TransportError> {
        let codec = self.codec;
        let written = codec.encode(frame, self.buffer())?;
        self.notify();
        Ok(written)
    }
}

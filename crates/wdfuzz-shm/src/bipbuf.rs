//! Lock-free bipartite ring buffer.
//!
//! Single producer, single consumer. Unlike a plain ring, every region handed
//! out by [`BipWriter::acquire_write`] and [`BipReader::acquire_read`] is
//! contiguous: when a write does not fit in the tail the writer wraps to
//! offset 0 and records the abandoned tail in the `invalidate` index so the
//! reader knows to wrap at the same point.
//!
//! One byte is always kept free so `read == write` unambiguously means empty.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    data: Box<[UnsafeCell<u8>]>,
    read: AtomicUsize,
    write: AtomicUsize,
    invalidate: AtomicUsize,
}

// The writer only touches [write, write + n) or [0, n) which the reader has
// released; the reader only touches committed bytes. Index publication is
// release/acquire so the two never observe the same byte concurrently.
unsafe impl Sync for Inner {}
unsafe impl Send for Inner {}

impl Inner {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8.
        self.data.as_ptr() as *mut u8
    }
}

/// Owner of the buffer before it is split between two threads.
pub struct BipBuffer {
    inner: Arc<Inner>,
}

impl BipBuffer {
    /// Allocate a buffer of `capacity` bytes. Usable space is `capacity - 1`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let data = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        Self {
            inner: Arc::new(Inner {
                data,
                read: AtomicUsize::new(0),
                write: AtomicUsize::new(0),
                invalidate: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.size()
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (BipWriter, BipReader) {
        (
            BipWriter {
                inner: Arc::clone(&self.inner),
                write_wrapped: false,
            },
            BipReader {
                inner: self.inner,
                read_wrapped: false,
            },
        )
    }
}

fn free_space(write: usize, read: usize, size: usize) -> usize {
    if read > write {
        read - write - 1
    } else {
        size - (write - read) - 1
    }
}

/// Producer half.
pub struct BipWriter {
    inner: Arc<Inner>,
    write_wrapped: bool,
}

impl BipWriter {
    /// Reserve a contiguous region of exactly `len` bytes.
    ///
    /// Returns `None` when neither the tail nor the head has room. Nothing is
    /// visible to the reader until [`release_write`](Self::release_write).
    pub fn acquire_write(&mut self, len: usize) -> Option<&mut [u8]> {
        let inner = &*self.inner;
        let size = inner.size();
        let write = inner.write.load(Ordering::Relaxed);
        let read = inner.read.load(Ordering::Acquire);

        let free = free_space(write, read, size);
        let linear_free = free.min(size - write);

        let start = if len <= linear_free {
            self.write_wrapped = false;
            write
        } else if len <= free - linear_free {
            self.write_wrapped = true;
            0
        } else {
            return None;
        };

        // SAFETY: [start, start + len) lies inside free space owned by the writer.
        Some(unsafe { std::slice::from_raw_parts_mut(inner.base().add(start), len) })
    }

    /// Commit `written` bytes of the last acquired region.
    pub fn release_write(&mut self, written: usize) {
        let inner = &*self.inner;
        let size = inner.size();
        let mut write = inner.write.load(Ordering::Relaxed);

        let mut invalidate = if self.write_wrapped {
            self.write_wrapped = false;
            let tail = write;
            write = 0;
            tail
        } else {
            inner.invalidate.load(Ordering::Relaxed)
        };

        write += written;
        if write > invalidate {
            invalidate = write;
        }
        if write == size {
            write = 0;
        }

        inner.invalidate.store(invalidate, Ordering::Release);
        inner.write.store(write, Ordering::Release);
    }

    /// Copy `data` in as one contiguous record. Returns false when it does not fit.
    pub fn push(&mut self, data: &[u8]) -> bool {
        match self.acquire_write(data.len()) {
            Some(region) => {
                region.copy_from_slice(data);
                self.release_write(data.len());
                true
            }
            None => false,
        }
    }
}

/// Consumer half.
pub struct BipReader {
    inner: Arc<Inner>,
    read_wrapped: bool,
}

impl BipReader {
    /// The contiguous committed region at the read cursor. Empty when there is nothing to read.
    pub fn acquire_read(&mut self) -> &[u8] {
        let inner = &*self.inner;
        let read = inner.read.load(Ordering::Relaxed);
        let write = inner.write.load(Ordering::Acquire);

        let (start, end) = if read == write {
            (read, read)
        } else if read < write {
            (read, write)
        } else {
            let invalidate = inner.invalidate.load(Ordering::Acquire);
            if read == invalidate {
                self.read_wrapped = true;
                (0, write)
            } else {
                (read, invalidate)
            }
        };

        // SAFETY: [start, end) has been committed by the writer and not yet released.
        unsafe { std::slice::from_raw_parts(inner.base().add(start), end - start) }
    }

    /// Hand `consumed` bytes of the last acquired region back to the writer.
    pub fn release_read(&mut self, consumed: usize) {
        let inner = &*self.inner;
        let size = inner.size();
        let mut read = inner.read.load(Ordering::Relaxed);

        if self.read_wrapped {
            self.read_wrapped = false;
            read = 0;
        }

        read += consumed;
        if read == size {
            read = 0;
        }

        inner.read.store(read, Ordering::Release);
    }

    /// True when the reader has caught up with the writer.
    pub fn is_empty(&self) -> bool {
        self.inner.read.load(Ordering::Relaxed) == self.inner.write.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_reads_nothing() {
        let (_w, mut r) = BipBuffer::with_capacity(16).split();
        assert!(r.is_empty());
        assert!(r.acquire_read().is_empty());
    }

    #[test]
    fn test_fifo_single_record() {
        let (mut w, mut r) = BipBuffer::with_capacity(16).split();
        assert!(w.push(b"hello"));
        assert_eq!(r.acquire_read(), b"hello");
        r.release_read(5);
        assert!(r.is_empty());
    }

    #[test]
    fn test_never_completely_full() {
        let (mut w, _r) = BipBuffer::with_capacity(8).split();
        assert!(w.acquire_write(8).is_none());
        assert!(w.acquire_write(7).is_some());
        w.release_write(7);
        assert!(w.acquire_write(1).is_none());
    }

    #[test]
    fn test_wrap_keeps_regions_contiguous() {
        let (mut w, mut r) = BipBuffer::with_capacity(10).split();
        assert!(w.push(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(r.acquire_read(), &[1, 2, 3, 4, 5, 6]);
        r.release_read(6);

        // Only 4 bytes of tail left, so a 5 byte write wraps to the head.
        assert!(w.push(&[7, 8, 9, 10, 11]));
        let region = r.acquire_read().to_vec();
        assert_eq!(region, vec![7, 8, 9, 10, 11]);
        r.release_read(region.len());
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_drains_tail_before_wrapping() {
        let (mut w, mut r) = BipBuffer::with_capacity(10).split();
        assert!(w.push(&[1, 2, 3, 4]));
        let n = r.acquire_read().len();
        r.release_read(n);
        assert!(w.push(&[5, 6, 7, 8]));
        // Tail has 2 bytes left; this one wraps.
        assert!(w.push(&[9, 10, 11]));

        assert_eq!(r.acquire_read(), &[5, 6, 7, 8]);
        r.release_read(4);
        assert_eq!(r.acquire_read(), &[9, 10, 11]);
        r.release_read(3);
        assert!(r.is_empty());
    }

    #[test]
    fn test_wrap_refused_when_head_not_released() {
        let (mut w, mut r) = BipBuffer::with_capacity(10).split();
        assert!(w.push(&[0; 6]));
        assert_eq!(r.acquire_read().len(), 6);
        r.release_read(2);
        // Tail has 4 bytes, head has 1 usable byte.
        assert!(w.acquire_write(5).is_none());
        assert!(w.acquire_write(4).is_some());
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        let (mut w, mut r) = BipBuffer::with_capacity(64).split();
        let total: u32 = 5_000;

        let producer = std::thread::spawn(move || {
            let mut n = 0u32;
            while n < total {
                if w.push(&n.to_ne_bytes()) {
                    n += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        while expected < total {
            let region = r.acquire_read();
            if region.len() < 4 {
                std::thread::yield_now();
                continue;
            }
            let value = u32::from_ne_bytes([region[0], region[1], region[2], region[3]]);
            assert_eq!(value, expected);
            r.release_read(4);
            expected += 1;
        }
        producer.join().unwrap();
    }
}

//! Bounded relay ring between the capture and processing stages

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::capture::frame::{Frame, FrameMetadata};
use crate::error::{PipelineError, Result};

/// Slots in the relay ring. One slot always stays empty to tell full from
/// empty, so the ring holds at most `DEFAULT_RELAY_SLOTS - 1` frames.
pub const DEFAULT_RELAY_SLOTS: usize = 3;

/// Pre-allocated storage for one frame payload
#[derive(Default)]
struct FrameSlot {
    data: Vec<u8>,
    len: usize,
    meta: Arc<FrameMetadata>,
    captured_at: Option<Instant>,
}

struct Ring {
    slots: Vec<FrameSlot>,
    write_idx: usize,
    read_idx: usize,
    // Set while a slot is lent out for copying outside the lock
    writing: bool,
    reading: bool,
}

impl Ring {
    fn is_full(&self) -> bool {
        (self.write_idx + 1) % self.slots.len() == self.read_idx
    }

    fn is_empty(&self) -> bool {
        self.write_idx == self.read_idx
    }

    fn len(&self) -> usize {
        (self.write_idx + self.slots.len() - self.read_idx) % self.slots.len()
    }
}

/// Single-producer, single-consumer ring of fixed-size frame slots.
///
/// The producer side never waits: a write into a full ring is dropped. The
/// consumer side blocks until a frame arrives or its cancel flag is raised.
pub struct RelayBuffer {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    slot_size: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Counter snapshot of a relay buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

impl RelayBuffer {
    /// Allocates `slots` payload buffers of `slot_size` bytes each. Failing to
    /// reserve the storage is the one unrecoverable pipeline error.
    pub fn new(slots: usize, slot_size: usize) -> Result<Self> {
        if slots < 2 {
            return Err(PipelineError::InvalidArgument(format!(
                "relay buffer needs at least 2 slots, got {slots}"
            )));
        }

        let mut storage = Vec::with_capacity(slots);
        for _ in 0..slots {
            let mut data = Vec::new();
            data.try_reserve_exact(slot_size)
                .map_err(|_| PipelineError::Allocation {
                    bytes: slot_size.saturating_mul(slots),
                })?;
            data.resize(slot_size, 0);
            storage.push(FrameSlot {
                data,
                ..FrameSlot::default()
            });
        }

        debug!(slots, slot_size, "relay buffer allocated");

        Ok(Self {
            ring: Mutex::new(Ring {
                slots: storage,
                write_idx: 0,
                read_idx: 0,
                writing: false,
                reading: false,
            }),
            not_empty: Condvar::new(),
            slot_size,
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Producer: copy `frame` into the next free slot.
    ///
    /// Returns `Dropped` without waiting when the ring is full.
    pub fn write(&self, frame: &Frame) -> Result<()> {
        if frame.len() > self.slot_size {
            return Err(PipelineError::FrameTooLarge {
                actual: frame.len(),
                capacity: self.slot_size,
            });
        }

        let (idx, mut slot) = {
            let mut ring = self.ring.lock();
            if ring.is_full() || ring.writing {
                drop(ring);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay_frames_dropped").increment(1);
                return Err(PipelineError::Dropped(frame.frame_number()));
            }
            ring.writing = true;
            let idx = ring.write_idx;
            (idx, std::mem::take(&mut ring.slots[idx]))
        };

        // The slot at write_idx is invisible to the reader until the index
        // advances, so the payload copy runs unlocked.
        slot.data[..frame.len()].copy_from_slice(&frame.data);
        slot.len = frame.len();
        slot.meta = Arc::clone(&frame.meta);
        slot.captured_at = Some(frame.timestamp);

        {
            let mut ring = self.ring.lock();
            ring.slots[idx] = slot;
            ring.write_idx = (idx + 1) % ring.slots.len();
            ring.writing = false;
        }
        self.not_empty.notify_one();

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_frames_written").increment(1);
        trace!(frame = frame.frame_number(), slot = idx, "relay write");
        Ok(())
    }

    /// Consumer: block until a frame is available and copy it out.
    ///
    /// `cancel` is checked before every wait and after every wake; raise it
    /// and call [`RelayBuffer::wake_readers`] to interrupt a blocked reader.
    pub fn read(&self, cancel: &AtomicBool) -> Result<Frame> {
        let (idx, slot) = {
            let mut ring = self.ring.lock();
            loop {
                if cancel.load(Ordering::Acquire) {
                    return Err(PipelineError::Cancelled);
                }
                // Re-checked on every wake: a notify does not imply data
                if !ring.is_empty() && !ring.reading {
                    break;
                }
                self.not_empty.wait(&mut ring);
            }
            ring.reading = true;
            let idx = ring.read_idx;
            (idx, std::mem::take(&mut ring.slots[idx]))
        };

        let frame = Frame {
            data: Bytes::copy_from_slice(&slot.data[..slot.len]),
            meta: Arc::clone(&slot.meta),
            timestamp: slot.captured_at.unwrap_or_else(Instant::now),
        };

        {
            let mut ring = self.ring.lock();
            ring.slots[idx] = slot;
            ring.read_idx = (idx + 1) % ring.slots.len();
            ring.reading = false;
        }
        // Another reader may be parked behind the `reading` flag
        self.not_empty.notify_one();

        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        trace!(frame = frame.frame_number(), slot = idx, "relay read");
        Ok(frame)
    }

    /// Lock-protected emptiness snapshot, does not consume anything.
    pub fn try_is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.try_is_empty()
    }

    /// Maximum number of frames the ring holds at once.
    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len() - 1
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Wake every blocked reader so it re-checks its cancel flag.
    pub fn wake_readers(&self) {
        let _ring = self.ring.lock();
        self.not_empty.notify_all();
    }

    /// Discard queued frames. Returns how many were thrown away.
    ///
    /// Meant for a stopped pipeline; a read in progress leaves the ring as is.
    pub fn clear(&self) -> usize {
        let mut ring = self.ring.lock();
        if ring.reading {
            return 0;
        }
        let stale = ring.len();
        ring.read_idx = ring.write_idx;
        if stale > 0 {
            debug!(stale, "relay buffer cleared");
        }
        stale
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn frame(n: u64, size: usize) -> Frame {
        Frame {
            data: Bytes::from(vec![n as u8; size]),
            meta: Arc::new(FrameMetadata {
                frame_number: n,
                ..FrameMetadata::default()
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn write_drops_when_full_and_never_exceeds_capacity() {
        let rb = RelayBuffer::new(DEFAULT_RELAY_SLOTS, 16).unwrap();
        assert_eq!(rb.capacity(), 2);
        assert_eq!(rb.slot_size(), 16);

        for n in 0..10u64 {
            let res = rb.write(&frame(n, 16));
            if n < 2 {
                assert!(res.is_ok());
            } else {
                assert_eq!(res, Err(PipelineError::Dropped(n)));
            }
            assert!(rb.len() <= rb.capacity());
        }

        let stats = rb.stats();
        assert_eq!(stats.written, 2);
        assert_eq!(stats.dropped, 8);
    }

    #[test]
    fn reads_come_out_in_write_order() {
        let rb = RelayBuffer::new(4, 8).unwrap();
        let cancel = AtomicBool::new(false);

        for round in 0..5u64 {
            rb.write(&frame(round * 2, 8)).unwrap();
            rb.write(&frame(round * 2 + 1, 8)).unwrap();
            let a = rb.read(&cancel).unwrap();
            let b = rb.read(&cancel).unwrap();
            assert_eq!(a.frame_number(), round * 2);
            assert_eq!(b.frame_number(), round * 2 + 1);
            assert_eq!(&a.data[..], &[(round * 2) as u8; 8]);
        }
        assert!(rb.try_is_empty());
    }

    #[test]
    fn short_frames_keep_their_length() {
        let rb = RelayBuffer::new(3, 32).unwrap();
        let cancel = AtomicBool::new(false);
        rb.write(&frame(1, 10)).unwrap();
        assert_eq!(rb.read(&cancel).unwrap().len(), 10);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let rb = RelayBuffer::new(3, 4).unwrap();
        assert_eq!(
            rb.write(&frame(0, 5)),
            Err(PipelineError::FrameTooLarge {
                actual: 5,
                capacity: 4
            })
        );
        assert!(rb.try_is_empty());
    }

    #[test]
    fn too_few_slots_is_invalid() {
        assert!(matches!(
            RelayBuffer::new(1, 4),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let rb = Arc::new(RelayBuffer::new(3, 4).unwrap());
        let cancel = Arc::new(AtomicBool::new(false));

        let reader = {
            let rb = Arc::clone(&rb);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || rb.read(&cancel))
        };

        thread::sleep(Duration::from_millis(50));
        rb.write(&frame(7, 4)).unwrap();

        let got = reader.join().unwrap().unwrap();
        assert_eq!(got.frame_number(), 7);
    }

    #[test]
    fn blocked_reader_is_cancelled() {
        let rb = Arc::new(RelayBuffer::new(3, 4).unwrap());
        let cancel = Arc::new(AtomicBool::new(false));

        let reader = {
            let rb = Arc::clone(&rb);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                let started = Instant::now();
                (rb.read(&cancel), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::Release);
        rb.wake_readers();

        let (res, waited) = reader.join().unwrap();
        assert_eq!(res.unwrap_err(), PipelineError::Cancelled);
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn clear_discards_stale_frames() {
        let rb = RelayBuffer::new(3, 4).unwrap();
        rb.write(&frame(0, 4)).unwrap();
        rb.write(&frame(1, 4)).unwrap();
        assert_eq!(rb.clear(), 2);
        assert!(rb.try_is_empty());
        // Ring is usable again after clearing
        rb.write(&frame(2, 4)).unwrap();
        assert_eq!(rb.len(), 1);
    }

    #[test]
    fn producer_never_blocks_against_slow_consumer() {
        let rb = Arc::new(RelayBuffer::new(3, 64).unwrap());
        let cancel = Arc::new(AtomicBool::new(false));

        let consumer = {
            let rb = Arc::clone(&rb);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                let mut last = None;
                while let Ok(f) = rb.read(&cancel) {
                    if let Some(prev) = last {
                        assert!(f.frame_number() > prev);
                    }
                    last = Some(f.frame_number());
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let started = Instant::now();
        for n in 0..2_000u64 {
            let _ = rb.write(&frame(n, 64));
            assert!(rb.len() <= rb.capacity());
        }
        // 2000 writes against a consumer sleeping 1ms per frame
        assert!(started.elapsed() < Duration::from_secs(1));

        cancel.store(true, Ordering::Release);
        rb.wake_readers();
        consumer.join().unwrap();

        let stats = rb.stats();
        assert_eq!(stats.written + stats.dropped, 2_000);
        assert!(stats.dropped > 0);
    }
}

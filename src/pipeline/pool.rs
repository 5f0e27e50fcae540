//! Client-facing pool of frame buffers
//!
//! Buffers cycle through `Free -> Queued -> Done|Error -> Free`. The client
//! owns `Free` buffers, the pipeline owns `Queued` ones, and a filled buffer
//! goes back to the client when it is dequeued. Queued and filled buffers sit
//! in one FIFO in enqueue order: filled entries at the head, entries still
//! waiting for data behind them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Producer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::capture::Frame;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    /// Owned by the client
    Free,
    /// Owned by the pipeline, waiting for data
    Queued,
    /// Filled, waiting to be dequeued
    Done,
    /// Aborted by stream-off, waiting to be dequeued
    Error,
}

/// What happens to buffers still waiting for data when a stream stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainMode {
    /// Hand them back to the client marked `Error`
    #[default]
    Error,
    /// Keep them queued for the next stream-on
    Requeue,
}

impl DrainMode {
    pub fn target_state(self) -> BufferState {
        match self {
            DrainMode::Error => BufferState::Error,
            DrainMode::Requeue => BufferState::Queued,
        }
    }
}

/// Snapshot of one pool buffer as seen by the client
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub index: usize,
    pub state: BufferState,
    /// Payload bytes in use
    pub length: usize,
    /// Delivery counter, contiguous within a stream session
    pub sequence: u64,
    /// Capture counter of the frame held; gaps mean dropped frames
    pub frame_number: u64,
    /// Delivery time relative to pool creation
    pub timestamp: Duration,
    /// Stable until the buffer is enqueued again
    pub data: Bytes,
}

struct Slot {
    state: BufferState,
    length: usize,
    sequence: u64,
    frame_number: u64,
    timestamp: Duration,
    data: Bytes,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: BufferState::Free,
            length: 0,
            sequence: 0,
            frame_number: 0,
            timestamp: Duration::ZERO,
            data: Bytes::new(),
        }
    }

    fn snapshot(&self, index: usize) -> FrameBuffer {
        FrameBuffer {
            index,
            state: self.state,
            length: self.length,
            sequence: self.sequence,
            frame_number: self.frame_number,
            timestamp: self.timestamp,
            data: self.data.clone(),
        }
    }
}

struct PoolState {
    slots: Vec<Slot>,
    fifo: HeapRb<usize>,
    sequence: u64,
    // Id of the stream session currently using the pool
    session: Option<u64>,
    latest_session: u64,
    // Bumped by stream-off; waiters that saw an older value are cancelled
    cancel_epoch: u64,
}

impl PoolState {
    fn in_session(&self) -> bool {
        self.session.is_some()
    }

    fn queued_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == BufferState::Queued)
            .count()
    }

    /// Pop the FIFO head if it has been filled or aborted.
    fn pop_ready(&mut self) -> Option<FrameBuffer> {
        let idx = *self.fifo.try_peek()?;
        match self.slots[idx].state {
            BufferState::Done | BufferState::Error => {
                self.fifo.try_pop();
                let buf = self.slots[idx].snapshot(idx);
                // Ownership returns to the client
                self.slots[idx].state = BufferState::Free;
                Some(buf)
            }
            _ => None,
        }
    }

    /// Hand every filled or aborted buffer still in the FIFO back to the
    /// client as `Free`, keeping queued entries in order.
    fn reclaim_finished(&mut self) -> usize {
        let pending: Vec<usize> = self.fifo.pop_iter().collect();
        let mut reclaimed = 0;
        for idx in pending {
            match self.slots[idx].state {
                BufferState::Done | BufferState::Error => {
                    self.slots[idx].state = BufferState::Free;
                    reclaimed += 1;
                }
                _ => {
                    // Same capacity it was popped from
                    let _ = self.fifo.try_push(idx);
                }
            }
        }
        reclaimed
    }
}

pub struct BufferPool {
    state: Mutex<PoolState>,
    ready: Condvar,
    frame_size: usize,
    min_buffers_needed: usize,
    max_buffers: usize,
    epoch: Instant,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    delivered: AtomicU64,
    no_sink: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub delivered: u64,
    pub no_sink: u64,
}

impl BufferPool {
    pub fn new(frame_size: usize, min_buffers_needed: usize, max_buffers: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                fifo: HeapRb::new(1),
                sequence: 0,
                session: None,
                latest_session: 0,
                cancel_epoch: 0,
            }),
            ready: Condvar::new(),
            frame_size,
            min_buffers_needed,
            max_buffers,
            epoch: Instant::now(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Allocate `count` buffers, all `Free`, replacing any previous set.
    ///
    /// Requests above the pool maximum are clamped; the number actually
    /// allocated is returned.
    pub fn configure(&self, count: usize) -> Result<usize> {
        if count < self.min_buffers_needed {
            return Err(PipelineError::NotEnoughBuffers {
                requested: count,
                needed: self.min_buffers_needed,
            });
        }
        let count = count.min(self.max_buffers);

        let mut st = self.state.lock();
        if st.in_session() {
            return Err(PipelineError::Busy);
        }
        st.slots = (0..count).map(|_| Slot::new()).collect();
        st.fifo = HeapRb::new(count);
        st.sequence = 0;
        drop(st);

        info!(count, "buffer pool configured");
        Ok(count)
    }

    /// Free every buffer. Only allowed outside a stream session.
    pub fn release(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.in_session() {
            return Err(PipelineError::Busy);
        }
        st.slots.clear();
        st.fifo = HeapRb::new(1);
        st.sequence = 0;
        drop(st);

        info!("buffer pool released");
        Ok(())
    }

    /// Client hands a `Free` buffer to the pipeline. Returns how many
    /// buffers are queued afterwards.
    pub fn enqueue(&self, index: usize) -> Result<usize> {
        let mut st = self.state.lock();
        let count = st.slots.len();
        let slot = st
            .slots
            .get_mut(index)
            .ok_or(PipelineError::InvalidIndex { index, count })?;

        if slot.state != BufferState::Free {
            return Err(PipelineError::InvalidBufferState {
                index,
                actual: slot.state,
                expected: BufferState::Free,
            });
        }
        slot.state = BufferState::Queued;
        slot.length = 0;
        slot.data = Bytes::new();

        if st.fifo.try_push(index).is_err() {
            // Each index sits in the FIFO at most once, so this is unreachable
            // while the state machine holds.
            st.slots[index].state = BufferState::Free;
            return Err(PipelineError::InvalidBufferState {
                index,
                actual: BufferState::Queued,
                expected: BufferState::Free,
            });
        }

        let queued = st.queued_count();
        trace!(index, queued, "buffer queued");
        Ok(queued)
    }

    /// Block until the FIFO head is filled or aborted and hand it back.
    ///
    /// Fails with `Cancelled` if stream-off happens while waiting, and with
    /// `NotStreaming` instead of blocking when no session could fill it.
    pub fn dequeue(&self) -> Result<FrameBuffer> {
        let mut st = self.state.lock();
        let epoch = st.cancel_epoch;
        loop {
            if st.cancel_epoch != epoch {
                return Err(PipelineError::Cancelled);
            }
            if let Some(buf) = st.pop_ready() {
                trace!(index = buf.index, sequence = buf.sequence, "buffer dequeued");
                return Ok(buf);
            }
            if !st.in_session() {
                return Err(PipelineError::NotStreaming);
            }
            self.ready.wait(&mut st);
        }
    }

    /// Non-blocking dequeue: `None` when the head is not ready yet.
    pub fn try_dequeue(&self) -> Result<Option<FrameBuffer>> {
        let mut st = self.state.lock();
        if st.slots.is_empty() {
            return Err(PipelineError::NotStreaming);
        }
        Ok(st.pop_ready())
    }

    /// Snapshot of a buffer without changing its owner.
    pub fn query(&self, index: usize) -> Result<FrameBuffer> {
        let st = self.state.lock();
        st.slots
            .get(index)
            .map(|slot| slot.snapshot(index))
            .ok_or(PipelineError::InvalidIndex {
                index,
                count: st.slots.len(),
            })
    }

    /// Move every buffer still waiting for data to `mode`'s state. Aborted
    /// buffers stay in FIFO order so the client can dequeue them. Returns the
    /// number of buffers touched.
    pub fn drain(&self, mode: DrainMode) -> usize {
        let target = mode.target_state();
        let mut st = self.state.lock();
        let PoolState { slots, fifo, .. } = &mut *st;

        let mut drained = 0;
        for &idx in fifo.iter() {
            if slots[idx].state == BufferState::Queued {
                slots[idx].state = target;
                drained += 1;
            }
        }
        drop(st);
        self.ready.notify_all();

        debug!(drained, ?mode, "buffer pool drained");
        drained
    }

    /// Wake every blocked `dequeue()` with `Cancelled`.
    pub fn cancel_waiters(&self) {
        let mut st = self.state.lock();
        st.cancel_epoch = st.cancel_epoch.wrapping_add(1);
        drop(st);
        self.ready.notify_all();
    }

    /// Mark the pool as used by stream session `id`. Ids only move forward, a
    /// late call for an older session is ignored.
    ///
    /// Buffers filled or aborted in an earlier session that the client never
    /// dequeued become `Free` again, so the new session's sequence starts
    /// from 0 without duplicates.
    pub(crate) fn begin_session(&self, id: u64) -> bool {
        let mut st = self.state.lock();
        if id < st.latest_session {
            return false;
        }
        st.latest_session = id;
        st.session = Some(id);
        st.sequence = 0;

        // Leftovers of the previous session would share its sequence numbers
        let reclaimed = st.reclaim_finished();
        drop(st);
        if reclaimed > 0 {
            debug!(session = id, reclaimed, "undequeued buffers returned as free");
        }
        true
    }

    /// Leave session `id` and restart the sequence counter.
    pub(crate) fn end_session(&self, id: u64) {
        let mut st = self.state.lock();
        if st.session == Some(id) {
            st.session = None;
            st.sequence = 0;
        }
        drop(st);
        self.ready.notify_all();
    }

    pub fn count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queued_count()
    }

    pub fn min_buffers_needed(&self) -> usize {
        self.min_buffers_needed
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            no_sink: self.stats.no_sink.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for BufferPool {
    /// Fill the oldest buffer still waiting for data. Never blocks: with no
    /// buffer queued the frame is dropped with `NoSink`.
    fn deliver(&self, frame: Frame) -> Result<u64> {
        if frame.len() > self.frame_size {
            return Err(PipelineError::FrameTooLarge {
                actual: frame.len(),
                capacity: self.frame_size,
            });
        }
        let frame_number = frame.frame_number();

        let mut st = self.state.lock();
        let PoolState {
            slots,
            fifo,
            sequence,
            ..
        } = &mut *st;

        let Some(idx) = fifo
            .iter()
            .copied()
            .find(|&i| slots[i].state == BufferState::Queued)
        else {
            self.stats.no_sink.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("pool_frames_no_sink").increment(1);
            debug!(frame_number, "no queued buffer, frame dropped");
            return Err(PipelineError::NoSink(frame_number));
        };

        let stamped = *sequence;
        *sequence += 1;

        let slot = &mut slots[idx];
        slot.length = frame.len();
        slot.data = frame.data;
        slot.sequence = stamped;
        slot.frame_number = frame_number;
        slot.timestamp = self.epoch.elapsed();
        slot.state = BufferState::Done;
        drop(st);

        self.ready.notify_all();
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pool_frames_delivered").increment(1);
        trace!(index = idx, sequence = stamped, frame_number, "buffer done");
        Ok(stamped)
    }
}

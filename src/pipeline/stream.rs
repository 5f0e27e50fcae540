//! Stream session lifecycle: `Idle -> Starting -> Streaming -> Stopping -> Idle`
//!
//! Control calls take the session lock only long enough to flip the state.
//! Worker start-up, joins and pool bookkeeping happen outside it, so no
//! thread ever holds the session lock together with a pool or relay lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::capture::source::{FrameSource, SourceStats};
use crate::capture::CaptureStage;
use crate::error::{PipelineError, Result};
use crate::pipeline::pool::{BufferPool, DrainMode};
use crate::pipeline::processing::ProcessingStage;
use crate::pipeline::RelayBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Idle,
    /// Stream-on requested, waiting for enough queued buffers
    Starting,
    Streaming,
    Stopping,
}

struct StreamSession {
    state: StreamState,
    id: u64,
    min_buffers_needed: usize,
    workers: Option<Workers>,
}

struct Workers {
    source: FrameSource,
    processing: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

pub struct StreamController {
    session: Mutex<StreamSession>,
    relay: Arc<RelayBuffer>,
    capture: Arc<CaptureStage>,
    processing: Arc<ProcessingStage>,
    pool: Arc<BufferPool>,
    period: Duration,
    drain_mode: DrainMode,
    // Trigger counters of sessions that already ended
    fired: AtomicU64,
    overruns: AtomicU64,
}

impl StreamController {
    pub fn new(
        relay: Arc<RelayBuffer>,
        capture: Arc<CaptureStage>,
        processing: Arc<ProcessingStage>,
        pool: Arc<BufferPool>,
        period: Duration,
        drain_mode: DrainMode,
    ) -> Self {
        Self {
            session: Mutex::new(StreamSession {
                state: StreamState::Idle,
                id: 0,
                min_buffers_needed: pool.min_buffers_needed(),
                workers: None,
            }),
            relay,
            capture,
            processing,
            pool,
            period,
            drain_mode,
            fired: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    /// `Idle -> Starting`, and straight on to `Streaming` when enough buffers
    /// are already queued.
    pub fn stream_on(&self) -> Result<StreamState> {
        let id = {
            let mut s = self.session.lock();
            if s.state != StreamState::Idle {
                return Err(PipelineError::AlreadyStreaming);
            }
            s.id += 1;
            s.state = StreamState::Starting;
            s.min_buffers_needed = self.pool.min_buffers_needed();
            info!(session = s.id, min_buffers = s.min_buffers_needed, "stream on");
            s.id
        };

        self.pool.begin_session(id);

        // A stream-off may have slipped in before the pool saw the session
        if !self.is_session(id, StreamState::Starting) {
            self.pool.end_session(id);
            return Err(PipelineError::Cancelled);
        }

        self.try_start(self.pool.queued_count())
    }

    /// Re-evaluate the minimum-buffer rule after a successful enqueue.
    pub fn on_buffer_queued(&self, queued: usize) -> Result<StreamState> {
        self.try_start(queued)
    }

    fn try_start(&self, queued: usize) -> Result<StreamState> {
        let mut s = self.session.lock();
        if s.state != StreamState::Starting {
            return Ok(s.state);
        }
        if queued < s.min_buffers_needed {
            debug!(queued, needed = s.min_buffers_needed, "waiting for buffers");
            return Ok(StreamState::Starting);
        }

        match self.spawn_workers() {
            Ok(workers) => {
                s.workers = Some(workers);
                s.state = StreamState::Streaming;
                info!(session = s.id, queued, "streaming");
                Ok(StreamState::Streaming)
            }
            Err(e) => {
                let id = s.id;
                s.state = StreamState::Idle;
                drop(s);

                error!(error = %e, "failed to start workers");
                // Queued buffers stay queued for the next attempt
                self.pool.drain(DrainMode::Requeue);
                self.pool.end_session(id);
                Err(e)
            }
        }
    }

    fn spawn_workers(&self) -> Result<Workers> {
        let mut source = FrameSource::new();
        let capture = Arc::clone(&self.capture);
        source.start(self.period, move || {
            // Drops are counted and logged by the stage
            let _ = capture.on_trigger();
        })?;

        let cancel = Arc::new(AtomicBool::new(false));
        let processing = {
            let stage = Arc::clone(&self.processing);
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name("processing".into())
                .spawn(move || stage.run(&cancel))
        };

        match processing {
            Ok(processing) => Ok(Workers {
                source,
                processing,
                cancel,
            }),
            Err(e) => {
                source.stop();
                Err(PipelineError::Spawn("processing", e.to_string()))
            }
        }
    }

    /// `Streaming -> Stopping -> Idle`. A no-op when already idle or when
    /// another caller is stopping the stream.
    pub fn stream_off(&self) -> Result<()> {
        let (id, workers) = {
            let mut s = self.session.lock();
            match s.state {
                StreamState::Idle | StreamState::Stopping => return Ok(()),
                StreamState::Starting | StreamState::Streaming => {}
            }
            s.state = StreamState::Stopping;
            (s.id, s.workers.take())
        };
        info!(session = id, "stream off");

        // Blocked clients return first, they do not wait for the joins
        self.pool.cancel_waiters();

        if let Some(workers) = workers {
            self.stop_workers(workers);
        }

        let stale = self.relay.clear();
        let drained = self.pool.drain(self.drain_mode);
        self.pool.end_session(id);

        self.session.lock().state = StreamState::Idle;
        info!(session = id, drained, stale, "stream idle");
        Ok(())
    }

    fn stop_workers(&self, mut workers: Workers) {
        // No trigger fires and no capture runs after this
        workers.source.stop();

        workers.cancel.store(true, Ordering::Release);
        self.relay.wake_readers();
        if workers.processing.join().is_err() {
            warn!("processing worker panicked");
        }

        let stats = workers.source.stats();
        self.fired.fetch_add(stats.fired, Ordering::Relaxed);
        self.overruns.fetch_add(stats.overruns, Ordering::Relaxed);
    }

    fn is_session(&self, id: u64, state: StreamState) -> bool {
        let s = self.session.lock();
        s.id == id && s.state == state
    }

    pub fn state(&self) -> StreamState {
        self.session.lock().state
    }

    /// Whether the periodic trigger is running.
    pub fn is_source_active(&self) -> bool {
        self.session
            .lock()
            .workers
            .as_ref()
            .is_some_and(|w| w.source.is_active())
    }

    /// Trigger counters across every session so far.
    pub fn source_stats(&self) -> SourceStats {
        let current = self
            .session
            .lock()
            .workers
            .as_ref()
            .map(|w| w.source.stats())
            .unwrap_or_default();
        SourceStats {
            fired: self.fired.load(Ordering::Relaxed) + current.fired,
            overruns: self.overruns.load(Ordering::Relaxed) + current.overruns,
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let _ = self.stream_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameFormat;
    use crate::capture::TestPattern;
    use crate::pipeline::pool::BufferState;
    use std::time::Instant;

    struct Rig {
        pool: Arc<BufferPool>,
        controller: StreamController,
    }

    fn rig(drain_mode: DrainMode) -> Rig {
        let format = FrameFormat::fixed();
        let relay = Arc::new(RelayBuffer::new(3, format.frame_size).unwrap());
        let capture = Arc::new(CaptureStage::new(
            Arc::clone(&relay),
            Box::new(TestPattern),
            format,
        ));
        let processing = Arc::new(ProcessingStage::new(Arc::clone(&relay)));
        let pool = Arc::new(BufferPool::new(format.frame_size, 2, 8));
        processing.register_sink(Arc::clone(&pool));
        let controller = StreamController::new(
            relay,
            capture,
            processing,
            Arc::clone(&pool),
            Duration::from_millis(5),
            drain_mode,
        );
        Rig { pool, controller }
    }

    fn enqueue(rig: &Rig, index: usize) -> StreamState {
        let queued = rig.pool.enqueue(index).unwrap();
        rig.controller.on_buffer_queued(queued).unwrap()
    }

    #[test]
    fn waits_in_starting_until_minimum_is_queued() {
        let rig = rig(DrainMode::Error);
        rig.pool.configure(4).unwrap();

        assert_eq!(rig.controller.stream_on(), Ok(StreamState::Starting));
        assert!(!rig.controller.is_source_active());

        assert_eq!(enqueue(&rig, 0), StreamState::Starting);
        assert!(!rig.controller.is_source_active());

        assert_eq!(enqueue(&rig, 1), StreamState::Streaming);
        assert!(rig.controller.is_source_active());

        rig.controller.stream_off().unwrap();
        assert_eq!(rig.controller.state(), StreamState::Idle);
        assert!(!rig.controller.is_source_active());
    }

    #[test]
    fn starts_immediately_when_buffers_already_queued() {
        let rig = rig(DrainMode::Error);
        rig.pool.configure(2).unwrap();
        rig.pool.enqueue(0).unwrap();
        rig.pool.enqueue(1).unwrap();

        assert_eq!(rig.controller.stream_on(), Ok(StreamState::Streaming));
        assert_eq!(
            rig.controller.stream_on(),
            Err(PipelineError::AlreadyStreaming)
        );
        rig.controller.stream_off().unwrap();
    }

    #[test]
    fn stream_off_when_idle_is_a_no_op() {
        let rig = rig(DrainMode::Error);
        assert_eq!(rig.controller.stream_off(), Ok(()));
        assert_eq!(rig.controller.state(), StreamState::Idle);
    }

    #[test]
    fn stream_off_from_starting_returns_to_idle() {
        let rig = rig(DrainMode::Error);
        rig.pool.configure(4).unwrap();
        rig.controller.stream_on().unwrap();
        enqueue(&rig, 0);

        rig.controller.stream_off().unwrap();
        assert_eq!(rig.controller.state(), StreamState::Idle);
        assert_eq!(rig.pool.queued_count(), 0);
        assert_eq!(rig.pool.dequeue().unwrap().state, BufferState::Error);
    }

    #[test]
    fn stop_leaves_nothing_queued() {
        let rig = rig(DrainMode::Error);
        rig.pool.configure(4).unwrap();
        for i in 0..4 {
            rig.pool.enqueue(i).unwrap();
        }
        rig.controller.stream_on().unwrap();

        // Let at least one frame through
        let first = rig.pool.dequeue().unwrap();
        assert_eq!(first.state, BufferState::Done);
        assert_eq!(first.sequence, 0);

        rig.controller.stream_off().unwrap();
        assert_eq!(rig.pool.queued_count(), 0);

        let mut returned = 1;
        while let Ok(buf) = rig.pool.dequeue() {
            assert!(matches!(buf.state, BufferState::Done | BufferState::Error));
            returned += 1;
        }
        assert_eq!(returned, 4);
    }

    #[test]
    fn requeue_mode_keeps_buffers_and_restarts() {
        let rig = rig(DrainMode::Requeue);
        rig.pool.configure(2).unwrap();
        rig.pool.enqueue(0).unwrap();
        rig.pool.enqueue(1).unwrap();

        // Park the buffers: start and stop before any frame can land
        rig.controller.stream_on().unwrap();
        rig.controller.stream_off().unwrap();

        while let Ok(Some(buf)) = rig.pool.try_dequeue() {
            // Filled before the stop; hand it back
            rig.pool.enqueue(buf.index).unwrap();
        }
        assert_eq!(rig.pool.queued_count(), 2);

        assert_eq!(rig.controller.stream_on(), Ok(StreamState::Streaming));
        let buf = rig.pool.dequeue().unwrap();
        assert_eq!(buf.sequence, 0);
        rig.controller.stream_off().unwrap();
    }

    #[test]
    fn stream_off_cancels_blocked_dequeue() {
        let rig = Arc::new(rig(DrainMode::Error));
        rig.pool.configure(2).unwrap();
        rig.controller.stream_on().unwrap();
        enqueue(&rig, 0);

        let client = {
            let rig = Arc::clone(&rig);
            thread::spawn(move || {
                // Buffer 1 is never queued, so the stream stays in Starting
                // and nothing fills buffer 0
                let started = Instant::now();
                (rig.pool.dequeue(), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        let stop_at = Instant::now();
        rig.controller.stream_off().unwrap();

        let (res, _) = client.join().unwrap();
        assert_eq!(res.unwrap_err(), PipelineError::Cancelled);
        assert!(stop_at.elapsed() < Duration::from_secs(2));
    }
}

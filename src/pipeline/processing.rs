//! Processing stage: relay buffer in, delivery sink out

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, instrument, trace};

use crate::capture::Frame;
use crate::error::{PipelineError, Result};
use crate::pipeline::RelayBuffer;

/// Receives finished frames from the processing stage.
pub trait FrameSink: Send + Sync {
    /// Hand over one frame; returns the sequence number it was stamped with.
    /// Must not block.
    fn deliver(&self, frame: Frame) -> Result<u64>;
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn deliver(&self, frame: Frame) -> Result<u64> {
        (**self).deliver(frame)
    }
}

pub struct ProcessingStage {
    relay: Arc<RelayBuffer>,
    sink: ArcSwapOption<Box<dyn FrameSink>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    processed: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub processed: u64,
    pub delivered: u64,
    /// Frames with nowhere to go: no sink registered, or the sink refused
    pub discarded: u64,
}

impl ProcessingStage {
    pub fn new(relay: Arc<RelayBuffer>) -> Self {
        Self {
            relay,
            sink: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Register where processed frames go, replacing any previous sink.
    pub fn register_sink<S: FrameSink + 'static>(&self, sink: S) {
        let sink: Box<dyn FrameSink> = Box::new(sink);
        self.sink.store(Some(Arc::new(sink)));
        info!("delivery sink registered");
    }

    pub fn unregister_sink(&self) {
        self.sink.store(None);
        info!("delivery sink removed");
    }

    pub fn has_sink(&self) -> bool {
        self.sink.load().is_some()
    }

    /// Worker loop. Exits once `cancel` is raised; the flag is checked before
    /// blocking on the relay and after every wake.
    #[instrument(name = "processing", skip_all)]
    pub fn run(&self, cancel: &AtomicBool) {
        info!("processing stage started");
        while !cancel.load(Ordering::Acquire) {
            match self.step(cancel) {
                Ok(_) => {}
                Err(PipelineError::Cancelled) => break,
                // Drops are counted in step(); the loop never stalls on them
                Err(_) => {}
            }
        }
        info!("processing stage exiting");
    }

    /// Block for one frame, transform it and deliver it.
    pub fn step(&self, cancel: &AtomicBool) -> Result<u64> {
        let frame = self.relay.read(cancel)?;
        let frame = self.transform(frame);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let frame_number = frame.frame_number();
        let captured_at = frame.timestamp;

        let result = match self.sink.load_full() {
            Some(sink) => sink.deliver(frame),
            None => {
                error!(frame_number, "no delivery sink registered, frame discarded");
                Err(PipelineError::NoSink(frame_number))
            }
        };

        match &result {
            Ok(sequence) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                metrics::histogram!("frame_latency_us")
                    .record(captured_at.elapsed().as_micros() as f64);
                trace!(frame_number, sequence, "frame delivered");
            }
            Err(e) => {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(frame_number, error = %e, "frame not delivered");
            }
        }
        result
    }

    /// Placeholder for image processing: frames pass through untouched.
    fn transform(&self, frame: Frame) -> Frame {
        frame
    }

    pub fn stats(&self) -> ProcessingStats {
        ProcessingStats {
            processed: self.stats.processed.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Collect(Mutex<Vec<u64>>);

    impl FrameSink for Collect {
        fn deliver(&self, frame: Frame) -> Result<u64> {
            let mut seen = self.0.lock();
            seen.push(frame.frame_number());
            Ok(seen.len() as u64 - 1)
        }
    }

    struct Refuse;

    impl FrameSink for Refuse {
        fn deliver(&self, frame: Frame) -> Result<u64> {
            Err(PipelineError::NoSink(frame.frame_number()))
        }
    }

    fn frame(n: u64) -> Frame {
        Frame {
            data: Bytes::from_static(&[1, 2, 3, 4]),
            meta: Arc::new(FrameMetadata {
                frame_number: n,
                ..FrameMetadata::default()
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn delivers_in_relay_order() {
        let relay = Arc::new(RelayBuffer::new(3, 4).unwrap());
        let stage = ProcessingStage::new(Arc::clone(&relay));
        let sink = Arc::new(Collect::default());
        stage.register_sink(Arc::clone(&sink));
        let cancel = AtomicBool::new(false);

        relay.write(&frame(4)).unwrap();
        relay.write(&frame(9)).unwrap();
        assert_eq!(stage.step(&cancel), Ok(0));
        assert_eq!(stage.step(&cancel), Ok(1));

        assert_eq!(*sink.0.lock(), vec![4, 9]);
        assert_eq!(stage.stats().delivered, 2);
    }

    #[test]
    fn missing_sink_discards_without_stalling() {
        let relay = Arc::new(RelayBuffer::new(3, 4).unwrap());
        let stage = ProcessingStage::new(Arc::clone(&relay));
        let cancel = AtomicBool::new(false);
        assert!(!stage.has_sink());

        relay.write(&frame(0)).unwrap();
        assert_eq!(stage.step(&cancel), Err(PipelineError::NoSink(0)));

        stage.register_sink(Refuse);
        assert!(stage.has_sink());
        relay.write(&frame(1)).unwrap();
        assert_eq!(stage.step(&cancel), Err(PipelineError::NoSink(1)));

        stage.unregister_sink();
        assert!(!stage.has_sink());
        relay.write(&frame(2)).unwrap();
        assert_eq!(stage.step(&cancel), Err(PipelineError::NoSink(2)));

        let stats = stage.stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.discarded, 3);
        assert!(relay.try_is_empty());
    }

    #[test]
    fn run_loop_exits_on_cancel() {
        let relay = Arc::new(RelayBuffer::new(3, 4).unwrap());
        let stage = Arc::new(ProcessingStage::new(Arc::clone(&relay)));
        let sink = Arc::new(Collect::default());
        stage.register_sink(Arc::clone(&sink));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = {
            let stage = Arc::clone(&stage);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || stage.run(&cancel))
        };

        for n in 0..5 {
            while relay.write(&frame(n)).is_err() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.0.lock().len() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        cancel.store(true, Ordering::Release);
        relay.wake_readers();
        worker.join().unwrap();

        assert_eq!(*sink.0.lock(), vec![0, 1, 2, 3, 4]);
    }
}

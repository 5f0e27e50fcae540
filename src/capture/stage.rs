//! Capture stage: one synthesized frame per trigger, pushed into the relay

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::capture::frame::{Frame, FrameFormat, FrameMetadata};
use crate::error::{PipelineError, Result};
use crate::pipeline::RelayBuffer;

/// Produces the pixel payload for one frame.
///
/// A sensor-backed implementation would copy out of the transfer buffer here.
pub trait FrameGenerator: Send + Sync {
    fn generate(&self, frame_number: u64, format: &FrameFormat) -> Bytes;
}

/// Solid YUYV fills cycling through the eight SMPTE bar colours (BT.601,
/// limited range), one colour per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPattern;

impl TestPattern {
    /// Y0 U Y1 V
    pub const PALETTE: [[u8; 4]; 8] = [
        [235, 128, 235, 128], // white
        [210, 16, 210, 146],  // yellow
        [170, 166, 170, 16],  // cyan
        [145, 54, 145, 34],   // green
        [106, 202, 106, 222], // magenta
        [81, 90, 81, 240],    // red
        [41, 240, 41, 110],   // blue
        [16, 128, 16, 128],   // black
    ];

    pub fn colour(frame_number: u64) -> [u8; 4] {
        Self::PALETTE[(frame_number % Self::PALETTE.len() as u64) as usize]
    }
}

impl FrameGenerator for TestPattern {
    fn generate(&self, frame_number: u64, format: &FrameFormat) -> Bytes {
        let quad = Self::colour(frame_number);
        let mut data = quad.repeat(format.frame_size / quad.len());
        data.resize(format.frame_size, 0);
        Bytes::from(data)
    }
}

pub struct CaptureStage {
    relay: Arc<RelayBuffer>,
    generator: Box<dyn FrameGenerator>,
    format: FrameFormat,
    counter: AtomicU64,
    epoch: Instant,
    dropped: AtomicU64,
}

impl CaptureStage {
    pub fn new(
        relay: Arc<RelayBuffer>,
        generator: Box<dyn FrameGenerator>,
        format: FrameFormat,
    ) -> Self {
        Self {
            relay,
            generator,
            format,
            counter: AtomicU64::new(0),
            epoch: Instant::now(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Produce exactly one frame and offer it to the relay buffer.
    ///
    /// A dropped frame is logged and never re-submitted; its number stays
    /// unused so the gap is visible downstream.
    pub fn on_trigger(&self) -> Result<u64> {
        let frame_number = self.counter.fetch_add(1, Ordering::Relaxed);
        let timestamp = Instant::now();

        let frame = Frame {
            data: self.generator.generate(frame_number, &self.format),
            meta: Arc::new(FrameMetadata {
                frame_number,
                width: self.format.width,
                height: self.format.height,
                stride: self.format.bytes_per_line,
                format: self.format.pixel_format,
                device_timestamp: Some(timestamp.duration_since(self.epoch)),
            }),
            timestamp,
        };
        metrics::counter!("capture_frames_produced").increment(1);

        match self.relay.write(&frame) {
            Ok(()) => Ok(frame_number),
            Err(e @ PipelineError::Dropped(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(frame_number, "relay full, frame dropped");
                Err(e)
            }
            Err(e) => {
                warn!(frame_number, error = %e, "capture write failed");
                Err(e)
            }
        }
    }

    /// Frames produced so far, dropped or not.
    pub fn produced(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }
}

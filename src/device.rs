//! Client-facing capture device
//!
//! Owns every pipeline component and wires them together at construction:
//! relay, capture and processing stages, the buffer pool as the delivery sink,
//! and the stream controller on top.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::capture::frame::{FrameFormat, PixelFormat};
use crate::capture::{CaptureStage, FrameGenerator, TestPattern};
use crate::error::{PipelineError, Result};
use crate::pipeline::{
    BufferPool, FrameBuffer, ProcessingStage, RelayBuffer, StreamController, StreamState,
};
use crate::{Config, PipelineStats};

pub const DRIVER_NAME: &str = "relaycam";
pub const CARD_NAME: &str = "mipi-csi";
pub const INPUT_NAME: &str = "MIPI CSI Camera";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub driver: &'static str,
    pub card: &'static str,
    pub bus_info: String,
    pub video_capture: bool,
    pub read_write: bool,
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDescription {
    pub index: u32,
    pub pixel_format: PixelFormat,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputKind {
    Camera,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDescription {
    pub index: u32,
    pub name: &'static str,
    pub kind: InputKind,
}

pub struct CaptureDevice {
    controller: StreamController,
    relay: Arc<RelayBuffer>,
    capture: Arc<CaptureStage>,
    processing: Arc<ProcessingStage>,
    pool: Arc<BufferPool>,
    format: FrameFormat,
}

impl CaptureDevice {
    /// Device producing the colour-bar test pattern.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_generator(config, Box::new(TestPattern))
    }

    pub fn with_generator(config: &Config, generator: Box<dyn FrameGenerator>) -> Result<Self> {
        config.validate()?;
        let format = FrameFormat::fixed();
        let pipeline = &config.pipeline;

        let relay = Arc::new(RelayBuffer::new(pipeline.relay_slots, format.frame_size)?);
        let capture = Arc::new(CaptureStage::new(Arc::clone(&relay), generator, format));
        let processing = Arc::new(ProcessingStage::new(Arc::clone(&relay)));
        let pool = Arc::new(BufferPool::new(
            format.frame_size,
            pipeline.min_buffers_needed,
            pipeline.max_buffers,
        ));
        processing.register_sink(Arc::clone(&pool));

        let controller = StreamController::new(
            Arc::clone(&relay),
            Arc::clone(&capture),
            Arc::clone(&processing),
            Arc::clone(&pool),
            config.frame_period(),
            pipeline.drain_mode,
        );

        info!(
            width = format.width,
            height = format.height,
            fps = config.capture.fps,
            relay_slots = pipeline.relay_slots,
            "capture device ready"
        );
        Ok(Self {
            controller,
            relay,
            capture,
            processing,
            pool,
            format,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            driver: DRIVER_NAME,
            card: CARD_NAME,
            bus_info: format!("platform:{DRIVER_NAME}"),
            video_capture: true,
            read_write: true,
            streaming: true,
        }
    }

    pub fn enum_format(&self, index: u32) -> Result<FormatDescription> {
        if index != 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "no format at index {index}"
            )));
        }
        let pixel_format = self.format.pixel_format;
        Ok(FormatDescription {
            index,
            pixel_format,
            description: pixel_format.description(),
        })
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn negotiate_format(&self) -> FrameFormat {
        self.format()
    }

    /// The device has one format; any request is answered with it.
    pub fn try_format(&self, requested: &FrameFormat) -> FrameFormat {
        if *requested != self.format {
            debug!(?requested, "format request ignored");
        }
        self.format
    }

    #[instrument(skip(self))]
    pub fn set_format(&self, requested: &FrameFormat) -> FrameFormat {
        self.try_format(requested)
    }

    pub fn enum_input(&self, index: u32) -> Result<InputDescription> {
        if index != 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "no input at index {index}"
            )));
        }
        Ok(InputDescription {
            index,
            name: INPUT_NAME,
            kind: InputKind::Camera,
        })
    }

    pub fn input(&self) -> u32 {
        0
    }

    pub fn set_input(&self, index: u32) -> Result<()> {
        self.enum_input(index).map(|_| ())
    }

    /// Allocate a fresh set of `count` free buffers. Returns the number
    /// actually allocated after clamping to the pool maximum.
    #[instrument(skip(self))]
    pub fn configure_buffers(&self, count: usize) -> Result<usize> {
        self.pool.configure(count)
    }

    #[instrument(skip(self))]
    pub fn release_buffers(&self) -> Result<()> {
        self.pool.release()
    }

    pub fn query_buffer(&self, index: usize) -> Result<FrameBuffer> {
        self.pool.query(index)
    }

    /// Hand buffer `index` to the pipeline. A stream waiting for buffers
    /// starts once this brings the queue up to the minimum.
    pub fn enqueue(&self, index: usize) -> Result<()> {
        let queued = self.pool.enqueue(index)?;
        self.controller.on_buffer_queued(queued)?;
        Ok(())
    }

    /// Block until the oldest queued buffer is filled or aborted.
    pub fn dequeue(&self) -> Result<FrameBuffer> {
        self.pool.dequeue()
    }

    pub fn try_dequeue(&self) -> Result<Option<FrameBuffer>> {
        self.pool.try_dequeue()
    }

    #[instrument(skip(self))]
    pub fn stream_on(&self) -> Result<StreamState> {
        self.controller.stream_on()
    }

    #[instrument(skip(self))]
    pub fn stream_off(&self) -> Result<()> {
        self.controller.stream_off()
    }

    pub fn state(&self) -> StreamState {
        self.controller.state()
    }

    pub fn is_source_active(&self) -> bool {
        self.controller.is_source_active()
    }

    pub fn stats(&self) -> PipelineStats {
        let relay = self.relay.stats();
        let processing = self.processing.stats();
        let pool = self.pool.stats();
        let source = self.controller.source_stats();
        PipelineStats {
            state: self.controller.state(),
            frames_produced: self.capture.produced(),
            frames_dropped: relay.dropped,
            frames_processed: processing.processed,
            frames_delivered: pool.delivered,
            frames_no_sink: pool.no_sink,
            trigger_fired: source.fired,
            trigger_overruns: source.overruns,
            buffers_queued: self.pool.queued_count(),
        }
    }
}

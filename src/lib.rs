pub mod capture;
pub mod device;
pub mod error;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use device::{Capabilities, CaptureDevice, FormatDescription, InputDescription, InputKind};
pub use error::{PipelineError, Result};
use pipeline::ringbuf::DEFAULT_RELAY_SLOTS;
use pipeline::{DrainMode, StreamState};

/// Environment variables override the file, e.g. `RELAYCAM__CAPTURE__FPS=60`
pub const ENV_PREFIX: &str = "RELAYCAM";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Trigger rate of the frame source
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub relay_slots: usize,
    /// Queued buffers required before streaming actually starts
    pub min_buffers_needed: usize,
    pub max_buffers: usize,
    pub drain_mode: DrainMode,
}

/// Settings for the bundled demo client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub buffer_count: usize,
    /// 0 runs until Ctrl-C
    pub run_for_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig { fps: 30 },
            pipeline: PipelineConfig {
                relay_slots: DEFAULT_RELAY_SLOTS,
                min_buffers_needed: 2,
                max_buffers: 32,
                drain_mode: DrainMode::Error,
            },
            client: ClientConfig {
                buffer_count: 4,
                run_for_secs: 10,
            },
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `RELAYCAM__*` variables.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PipelineError::InvalidArgument(msg.into()));
        if self.capture.fps == 0 {
            return invalid("capture.fps must be at least 1");
        }
        if self.pipeline.relay_slots < 2 {
            return invalid("pipeline.relay_slots must be at least 2");
        }
        if self.pipeline.min_buffers_needed == 0 {
            return invalid("pipeline.min_buffers_needed must be at least 1");
        }
        if self.pipeline.max_buffers < self.pipeline.min_buffers_needed {
            return invalid("pipeline.max_buffers is below pipeline.min_buffers_needed");
        }
        Ok(())
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.capture.fps.max(1)))
    }
}

/// Counters collected throughout the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub state: StreamState,
    /// Frames synthesized by the capture stage
    pub frames_produced: u64,
    /// Frames lost because the relay buffer was full
    pub frames_dropped: u64,
    pub frames_processed: u64,
    /// Frames that landed in a client buffer
    pub frames_delivered: u64,
    /// Processed frames with no queued buffer to land in
    pub frames_no_sink: u64,
    pub trigger_fired: u64,
    pub trigger_overruns: u64,
    pub buffers_queued: usize,
}

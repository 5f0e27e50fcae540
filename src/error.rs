//! Error taxonomy shared by every pipeline stage

use thiserror::Error;

use crate::pipeline::pool::BufferState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Relay buffer was full; the producer moved on without waiting.
    #[error("relay buffer full, frame {0} dropped")]
    Dropped(u64),

    /// No queued client buffer was waiting for this frame.
    #[error("no queued buffer to receive frame {0}")]
    NoSink(u64),

    #[error("need at least {needed} buffers, got {requested}")]
    NotEnoughBuffers { requested: usize, needed: usize },

    #[error("stream is already on")]
    AlreadyStreaming,

    #[error("stream is not on")]
    NotStreaming,

    #[error("buffer {index} is {actual:?}, expected {expected:?}")]
    InvalidBufferState {
        index: usize,
        actual: BufferState,
        expected: BufferState,
    },

    #[error("buffer index {index} out of range for a pool of {count}")]
    InvalidIndex { index: usize, count: usize },

    /// A blocked call was interrupted by stream-off.
    #[error("cancelled by stream-off")]
    Cancelled,

    #[error("buffer pool is in use by an active stream session")]
    Busy,

    #[error("frame payload of {actual} bytes exceeds slot capacity {capacity}")]
    FrameTooLarge { actual: usize, capacity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn {0} worker: {1}")]
    Spawn(&'static str, String),

    #[error("failed to allocate {bytes} bytes of frame storage")]
    Allocation { bytes: usize },
}

impl PipelineError {
    /// Everything except construction-time resource exhaustion can be handled
    /// locally without tearing the pipeline down.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PipelineError::Allocation { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

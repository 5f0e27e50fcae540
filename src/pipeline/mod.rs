pub mod pool;
pub mod processing;
pub mod ringbuf;
pub mod stream;

pub use pool::{BufferPool, BufferState, DrainMode, FrameBuffer};
pub use processing::{FrameSink, ProcessingStage};
pub use ringbuf::RelayBuffer;
pub use stream::{StreamController, StreamState};

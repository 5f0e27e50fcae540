pub mod frame;
pub mod source;
pub mod stage;

pub use frame::Frame;
pub use frame::FrameFormat;
pub use frame::PixelFormat;
pub use source::FrameSource;
pub use stage::{CaptureStage, FrameGenerator, TestPattern};

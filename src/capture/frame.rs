use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    /// Capture counter of this frame; gaps between delivered frames are drops.
    pub fn frame_number(&self) -> u64 {
        self.meta.frame_number
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_number", &self.meta.frame_number)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Offset from the capture clock origin
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, Y0 U Y1 V
    #[default]
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Yuyv => 2,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PixelFormat::Yuyv => "YUYV 4:2:2",
        }
    }
}

/// The one format the device produces. Requests for anything else are
/// answered with this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub bytes_per_line: u32,
    pub frame_size: usize,
    pub field: Field,
    pub colorspace: Colorspace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    #[default]
    Progressive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    #[default]
    Srgb,
}

pub const FRAME_WIDTH: u32 = 1280;
pub const FRAME_HEIGHT: u32 = 720;

impl FrameFormat {
    pub fn fixed() -> Self {
        let pixel_format = PixelFormat::Yuyv;
        // Four bytes for every two pixels
        let bytes_per_line = FRAME_WIDTH * pixel_format.bytes_per_pixel();
        Self {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            pixel_format,
            bytes_per_line,
            frame_size: bytes_per_line as usize * FRAME_HEIGHT as usize,
            field: Field::Progressive,
            colorspace: Colorspace::Srgb,
        }
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::fixed()
    }
}

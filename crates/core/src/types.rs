use std::fmt;

use anyhow::{bail, Result};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Interleaved channel order of an 8-bit frame buffer.
///
/// Decoders and image readers decide the order; the patch codec converts to the
/// model's RGB order and back, so a frame leaves the upscaler in the same order
/// it came in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

impl ChannelOrder {
    /// FFmpeg `rawvideo` pixel format name for this order.
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        match self {
            Self::Rgb => "rgb24",
            Self::Bgr => "bgr24",
        }
    }

    /// Index of the source channel that holds RGB channel `rgb_index`.
    pub(crate) fn rgb_source_index(self, rgb_index: usize) -> usize {
        match self {
            Self::Rgb => rgb_index,
            Self::Bgr => 2 - rgb_index,
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rgb => "rgb",
            Self::Bgr => "bgr",
        })
    }
}

/// Row-major, 3-channel, 8-bit pixel buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channel_order: ChannelOrder,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(data: Vec<u8>, width: u32, height: u32, channel_order: ChannelOrder) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("frame dimensions must be non-zero, got {width}x{height}");
        }
        let expected = width as usize * height as usize * Self::CHANNELS;
        if data.len() != expected {
            bail!(
                "frame data length mismatch: expected {} ({}x{}x{}), got {}",
                expected,
                width,
                height,
                Self::CHANNELS,
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
            channel_order,
        })
    }

    /// Build a frame from an `(H, W, 3)` array in any memory layout.
    pub fn from_array(pixels: Array3<u8>, channel_order: ChannelOrder) -> Result<Self> {
        let (height, width, channels) = pixels.dim();
        if channels != Self::CHANNELS {
            bail!("expected {} channels, got {channels}", Self::CHANNELS);
        }
        let data: Vec<u8> = pixels.iter().copied().collect();
        Self::new(data, width as u32, height as u32, channel_order)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// `(H, W, 3)` view over the pixel buffer.
    pub fn view(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(
            (self.height as usize, self.width as usize, Self::CHANNELS),
            &self.data,
        )
        .expect("frame buffer length is validated at construction")
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channel_order", &self.channel_order)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Axis-aligned pixel rectangle, `x`/`y` are the top-left corner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> usize {
        self.x + self.width
    }

    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

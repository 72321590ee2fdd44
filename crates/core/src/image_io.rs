//! Still-image read/write for batch jobs.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};

use crate::types::{ChannelOrder, Frame};

/// Decode any format the `image` crate understands into an RGB frame.
pub fn read_image(path: &Path) -> Result<Frame> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    Frame::new(decoded.into_raw(), width, height, ChannelOrder::Rgb)
}

/// Encode `frame` to `path`; the extension selects the format.
pub fn write_image(frame: &Frame, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("unsupported image extension: {}", path.display()))?;

    let data = match frame.channel_order() {
        ChannelOrder::Rgb => frame.as_bytes().to_vec(),
        ChannelOrder::Bgr => frame
            .as_bytes()
            .chunks_exact(Frame::CHANNELS)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
    };
    let buffer = RgbImage::from_raw(frame.width(), frame.height(), data)
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    buffer
        .save_with_format(path, format)
        .with_context(|| format!("failed to write image {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(order: ChannelOrder) -> Frame {
        let data = (0..4 * 3)
            .flat_map(|i| [(i * 20) as u8, 100, (255 - i * 20) as u8])
            .collect();
        Frame::new(data, 4, 3, order).unwrap()
    }

    #[test]
    fn test_png_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("frame.png");
        let frame = checker(ChannelOrder::Rgb);
        write_image(&frame, &path).unwrap();
        let back = read_image(&path).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_bgr_frame_is_written_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.bmp");
        let frame = checker(ChannelOrder::Bgr);
        write_image(&frame, &path).unwrap();
        let back = read_image(&path).unwrap();
        assert_eq!(back.channel_order(), ChannelOrder::Rgb);
        assert_eq!(back.view()[[0, 1, 0]], frame.view()[[0, 1, 2]]);
        assert_eq!(back.view()[[0, 1, 2]], frame.view()[[0, 1, 0]]);
    }

    #[test]
    fn test_unknown_extension_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_image(&checker(ChannelOrder::Rgb), &dir.path().join("x.unknown"));
        assert!(err.is_err());
    }

    #[test]
    fn test_read_missing_file_is_error() {
        assert!(read_image(Path::new("/nonexistent/picture.png")).is_err());
    }
}

//! Raw frame representation
//!
//! Describes the pixel layout negotiated with the external decoder and the
//! immutable frame payloads that travel from the reassembler thread to the
//! upload engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Pixel format the decoder is configured to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel
    #[default]
    Rgba8,
    /// 8-bit BGRA, 4 bytes per pixel
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }

    /// Name of the format as understood by ffmpeg's `-pix_fmt`
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "rgba",
            PixelFormat::Bgra8 => "bgra",
        }
    }

    /// Matching wgpu texture format
    pub fn texture_format(&self) -> wgpu::TextureFormat {
        // sRGB variants to match video color space
        match self {
            PixelFormat::Rgba8 => wgpu::TextureFormat::Rgba8UnormSrgb,
            PixelFormat::Bgra8 => wgpu::TextureFormat::Bgra8UnormSrgb,
        }
    }
}

/// Fixed geometry of every frame in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameLayout {
    /// Build a layout, rejecting empty or overflowing dimensions.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> StreamResult<Self> {
        if width == 0 || height == 0 {
            return Err(StreamError::invalid_argument(format!(
                "width and height must be non-zero (got {}x{})",
                width, height
            )));
        }
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(format.bytes_per_pixel()))
            .ok_or_else(|| {
                StreamError::invalid_argument(format!("frame size overflow for {}x{}", width, height))
            })?;
        Ok(Self { width, height, format })
    }

    /// Bytes in one complete frame (`width * height * bytesPerPixel`)
    pub fn frame_size(&self) -> usize {
        (self.width as usize) * (self.height as usize) * self.format.bytes_per_pixel()
    }

    /// Tightly packed bytes per row
    pub fn stride(&self) -> usize {
        (self.width as usize) * self.format.bytes_per_pixel()
    }

    /// Fail unless `len` is exactly one frame.
    pub fn check_len(&self, len: usize) -> StreamResult<()> {
        let expected = self.frame_size();
        if len != expected {
            return Err(StreamError::FrameSizeMismatch { expected, actual: len });
        }
        Ok(())
    }
}

/// One frame's worth of pixel bytes cut from the decoder output
///
/// The payload is a reference-counted slice of the reassembler's buffer, so
/// moving it across threads never copies pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFrame {
    /// Raw pixel bytes
    pub data: Bytes,
    /// Emission order within the session (0-based)
    pub index: u64,
    /// False only for the trailing partial flush at end of stream
    pub complete: bool,
}

impl PendingFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let layout = FrameLayout::new(1920, 1080, PixelFormat::Rgba8).unwrap();
        assert_eq!(layout.frame_size(), 1920 * 1080 * 4);
        assert_eq!(layout.stride(), 1920 * 4);

        let tiny = FrameLayout::new(2, 1, PixelFormat::Rgba8).unwrap();
        assert_eq!(tiny.frame_size(), 8);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(matches!(
            FrameLayout::new(0, 10, PixelFormat::Rgba8),
            Err(StreamError::InvalidArgument(_))
        ));
        assert!(FrameLayout::new(10, 0, PixelFormat::Bgra8).is_err());
    }

    #[test]
    fn test_check_len() {
        let layout = FrameLayout::new(2, 1, PixelFormat::Rgba8).unwrap();
        assert!(layout.check_len(8).is_ok());
        assert!(matches!(
            layout.check_len(5),
            Err(StreamError::FrameSizeMismatch { expected: 8, actual: 5 })
        ));
        assert!(layout.check_len(16).is_err());
    }

    #[test]
    fn test_ffmpeg_names() {
        assert_eq!(PixelFormat::Rgba8.ffmpeg_name(), "rgba");
        assert_eq!(PixelFormat::Bgra8.ffmpeg_name(), "bgra");
    }
}

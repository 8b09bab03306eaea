use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Frame data with zero-copy semantics
///
/// Cloning a frame only bumps reference counts; the pixel buffer itself is
/// never mutated once built.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Capture sequence number (per source) or composite sequence number
    pub sequence: u64,
    /// Source index, `None` for composites
    pub source: Option<usize>,
    pub format: FrameFormat,
    /// Synthetic content standing in for a missing source
    pub placeholder: bool,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Rgb24,
    Bgr24,
    Yuyv4,
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for a `width` x `height` image in this layout.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgba | Self::Bgra => pixels * 4,
            Self::Rgb24 | Self::Bgr24 => pixels * 3,
            Self::Yuyv4 => pixels * 2,
            Self::Nv12 => pixels + pixels / 2,
        }
    }
}

/// Resolution plus pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    pub fn rgba(width: u32, height: u32) -> Self {
        Self::new(width, height, PixelFormat::Rgba)
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

impl Frame {
    pub fn new(data: Bytes, source: Option<usize>, sequence: u64, format: FrameFormat) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                source,
                format,
                placeholder: false,
            }),
            timestamp: Instant::now(),
        }
    }

    /// Solid RGBA frame used when a slot has nothing better to show.
    pub fn solid(format: FrameFormat, rgba: [u8; 4], source: Option<usize>) -> Self {
        let data: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(format.width as usize * format.height as usize * 4)
            .collect();
        Self {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                source,
                format: FrameFormat::rgba(format.width, format.height),
                placeholder: true,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn source(&self) -> Option<usize> {
        self.meta.source
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn format(&self) -> FrameFormat {
        self.meta.format
    }

    pub fn is_placeholder(&self) -> bool {
        self.meta.placeholder
    }

    /// RGBA value at `(x, y)`; only meaningful for RGBA frames.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let format = self.meta.format;
        if format.pixel_format != PixelFormat::Rgba || x >= format.width || y >= format.height {
            return None;
        }
        let offset = (y as usize * format.width as usize + x as usize) * 4;
        let px = self.data.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Rgba.frame_size(1920, 1080), 1920 * 1080 * 4);
        assert_eq!(PixelFormat::Yuyv4.frame_size(4, 2), 16);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 2), 12);
    }

    #[test]
    fn test_solid_frame_pixels() {
        let frame = Frame::solid(FrameFormat::rgba(3, 2), [1, 2, 3, 255], Some(4));
        assert!(frame.is_placeholder());
        assert_eq!(frame.source(), Some(4));
        assert_eq!(frame.data.len(), 24);
        assert_eq!(frame.pixel(2, 1), Some([1, 2, 3, 255]));
        assert_eq!(frame.pixel(3, 0), None);
    }
}

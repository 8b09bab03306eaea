//! Format normalizer: pixel conversion and rescale to the cell format

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::capture::frame::{Frame, FrameFormat, FrameMetadata, PixelFormat};
use crate::capture::source::SourceHandle;
use crate::error::{Error, Result};
use crate::event::{EventSender, PipelineEvent};
use crate::pipeline::ringbuf::FrameQueue;
use crate::pipeline::SourceFeed;

/// Convert `frame` to RGBA at `target`'s resolution.
///
/// Deterministic; frames already in the target format are passed through
/// without copying.
pub fn normalize(frame: &Frame, target: FrameFormat) -> Result<Frame> {
    let format = frame.format();
    if target.pixel_format != PixelFormat::Rgba {
        return Err(Error::UnsupportedFormat(target.pixel_format));
    }
    if frame.data.len() != format.frame_size() {
        return Err(Error::FormatMismatch {
            source_index: frame.source().unwrap_or_default(),
            expected: format.frame_size(),
            actual: frame.data.len(),
        });
    }
    if format == target {
        return Ok(frame.clone());
    }

    let rgba = match format.pixel_format {
        PixelFormat::Rgba => frame.data.to_vec(),
        PixelFormat::Bgra => bgra_to_rgba(&frame.data),
        PixelFormat::Rgb24 => rgb_to_rgba(&frame.data, false),
        PixelFormat::Bgr24 => rgb_to_rgba(&frame.data, true),
        PixelFormat::Yuyv4 => yuyv_to_rgba(&frame.data),
        PixelFormat::Nv12 => nv12_to_rgba(&frame.data, format.width, format.height),
    };

    let data = if format.width == target.width && format.height == target.height {
        rgba
    } else {
        let image = RgbaImage::from_raw(format.width, format.height, rgba).ok_or(
            Error::FormatMismatch {
                source_index: frame.source().unwrap_or_default(),
                expected: format.frame_size(),
                actual: frame.data.len(),
            },
        )?;
        imageops::resize(&image, target.width, target.height, FilterType::Triangle).into_raw()
    };

    Ok(Frame {
        data: Bytes::from(data),
        meta: Arc::new(FrameMetadata {
            sequence: frame.sequence(),
            source: frame.source(),
            format: target,
            placeholder: frame.is_placeholder(),
        }),
        timestamp: frame.timestamp,
    })
}

fn bgra_to_rgba(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
    out
}

fn rgb_to_rgba(data: &[u8], swap: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for px in data.chunks_exact(3) {
        if swap {
            out.extend_from_slice(&[px[2], px[1], px[0], 255]);
        } else {
            out.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
    }
    out
}

/// BT.601 limited range YCbCr to RGBA
fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 4] {
    fn clamp(v: i32) -> u8 {
        v.clamp(0, 255) as u8
    }
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
        255,
    ]
}

/// Two pixels per 4-byte macropixel
fn yuyv_to_rgba(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for mp in data.chunks_exact(4) {
        let (y0, u, y1, v) = (mp[0], mp[1], mp[2], mp[3]);
        out.extend_from_slice(&yuv_pixel(y0, u, v));
        out.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    out
}

/// Full-resolution luma plane followed by an interleaved UV plane
/// subsampled 2x2.
fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (luma, chroma) = data.split_at(w * h);

    let mut out = Vec::with_capacity(w * h * 4);
    for row in 0..h {
        for col in 0..w {
            let at = (row / 2) * w + (col / 2) * 2;
            // Odd trailing rows past the chroma plane take neutral chroma
            let (u, v) = match chroma.get(at..at + 2) {
                Some(uv) => (uv[0], uv[1]),
                None => (128, 128),
            };
            out.extend_from_slice(&yuv_pixel(luma[row * w + col], u, v));
        }
    }
    out
}

/// Per-source normalizer task.
///
/// Pops raw frames from the ingest queue, normalizes them off the async
/// threads and publishes them to every slot selector subscribed to this
/// source. Failed conversions drop the frame and bump a counter.
pub async fn run_normalizer(
    source: SourceHandle,
    queue: Arc<FrameQueue>,
    output: SourceFeed,
    target: FrameFormat,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
    poll: Duration,
) {
    debug!("Normalizer for source {} started", source.index);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = queue.pop_timeout(poll) => frame,
        };
        let Some(frame) = frame else {
            continue;
        };

        let result = tokio::task::spawn_blocking(move || normalize(&frame, target)).await;
        match result {
            Ok(Ok(normalized)) => output.publish(normalized),
            Ok(Err(e)) => {
                let total = source.record_normalize_error();
                if total == 1 || total % 100 == 0 {
                    warn!("Source {} normalize failed ({} total): {}", source.index, total, e);
                    events.emit(PipelineEvent::NormalizeFailed {
                        source: source.index,
                        reason: e.to_string(),
                    });
                }
            }
            Err(e) => {
                warn!("Normalizer task for source {} panicked: {}", source.index, e);
            }
        }
    }

    debug!("Normalizer for source {} stopped", source.index);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(format: FrameFormat, data: Vec<u8>) -> Frame {
        Frame::new(Bytes::from(data), Some(1), 7, format)
    }

    #[test]
    fn test_passthrough_when_already_canonical() {
        let format = FrameFormat::rgba(2, 2);
        let frame = raw(format, vec![9; 16]);
        let out = normalize(&frame, format).unwrap();
        assert_eq!(out.data, frame.data);
        assert_eq!(out.sequence(), 7);
        assert_eq!(out.source(), Some(1));
    }

    #[test]
    fn test_bgra_swaps_channels() {
        let frame = raw(FrameFormat::new(1, 1, PixelFormat::Bgra), vec![1, 2, 3, 4]);
        let out = normalize(&frame, FrameFormat::rgba(1, 1)).unwrap();
        assert_eq!(&out.data[..], &[3, 2, 1, 4]);
    }

    #[test]
    fn test_rgb24_gains_alpha() {
        let frame = raw(FrameFormat::new(2, 1, PixelFormat::Rgb24), vec![10, 20, 30, 40, 50, 60]);
        let out = normalize(&frame, FrameFormat::rgba(2, 1)).unwrap();
        assert_eq!(&out.data[..], &[10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn test_yuyv_white_and_black() {
        // Y=235 is white, Y=16 is black at neutral chroma
        let frame = raw(FrameFormat::new(2, 1, PixelFormat::Yuyv4), vec![235, 128, 16, 128]);
        let out = normalize(&frame, FrameFormat::rgba(2, 1)).unwrap();
        assert_eq!(&out.data[..4], &[255, 255, 255, 255]);
        assert_eq!(&out.data[4..], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_downscale_keeps_solid_color() {
        let source = Frame::solid(FrameFormat::rgba(8, 8), [200, 100, 50, 255], Some(0));
        let out = normalize(&source, FrameFormat::rgba(4, 2)).unwrap();
        assert_eq!(out.format(), FrameFormat::rgba(4, 2));
        assert_eq!(out.data.len(), 32);
        for px in out.data.chunks_exact(4) {
            for (got, want) in px.iter().zip([200u8, 100, 50, 255]) {
                assert!(got.abs_diff(want) <= 1);
            }
        }
    }

    #[test]
    fn test_nv12_shares_chroma_across_quad() {
        // 2x2 luma: white, black, white, black; one neutral chroma pair
        let format = FrameFormat::new(2, 2, PixelFormat::Nv12);
        let frame = raw(format, vec![235, 16, 235, 16, 128, 128]);
        let out = normalize(&frame, FrameFormat::rgba(2, 2)).unwrap();
        assert_eq!(
            &out.data[..],
            &[255, 255, 255, 255, 0, 0, 0, 255, 255, 255, 255, 255, 0, 0, 0, 255]
        );
    }

    #[test]
    fn test_nv12_chroma_tints_pixels() {
        // Mid grey with strong Cr pushes red up and blue down
        let format = FrameFormat::new(2, 2, PixelFormat::Nv12);
        let frame = raw(format, vec![126, 126, 126, 126, 128, 240]);
        let out = normalize(&frame, FrameFormat::rgba(2, 2)).unwrap();
        for px in out.data.chunks_exact(4) {
            assert!(px[0] > 200, "red {}", px[0]);
            assert!(px[1] < px[0]);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn test_wrong_size_rejected() {
        let frame = raw(FrameFormat::rgba(2, 2), vec![0; 10]);
        assert!(matches!(
            normalize(&frame, FrameFormat::rgba(2, 2)),
            Err(Error::FormatMismatch { expected: 16, actual: 10, .. })
        ));
    }
}

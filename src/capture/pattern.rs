//! Built-in test pattern source
//!
//! Produces solid frames from a fixed palette at the declared frame rate,
//! so a mosaic can run without any external producer.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};

use crate::capture::frame::{FrameFormat, PixelFormat};

const PALETTE: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [128, 128, 128],
];

/// RGB color of pattern `n`.
pub fn pattern_color(n: u32) -> [u8; 3] {
    PALETTE[n as usize % PALETTE.len()]
}

/// Paced generator of raw frames in the source's declared layout.
pub struct PatternGenerator {
    frame: Bytes,
    interval: tokio::time::Interval,
}

impl PatternGenerator {
    pub fn new(pattern: u32, format: FrameFormat, fps: u32) -> Self {
        let frame = Bytes::from(solid_raw(pattern_color(pattern), format));
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { frame, interval }
    }

    /// Waits for the next frame period.
    pub async fn next_frame(&mut self) -> Bytes {
        self.interval.tick().await;
        self.frame.clone()
    }
}

fn solid_raw([r, g, b]: [u8; 3], format: FrameFormat) -> Vec<u8> {
    let pixel: Vec<u8> = match format.pixel_format {
        PixelFormat::Rgba => vec![r, g, b, 255],
        PixelFormat::Bgra => vec![b, g, r, 255],
        PixelFormat::Rgb24 => vec![r, g, b],
        PixelFormat::Bgr24 => vec![b, g, r],
        PixelFormat::Yuyv4 | PixelFormat::Nv12 => {
            // Luma-only grey ramp at neutral chroma
            let y = ((r as u32 * 66 + g as u32 * 129 + b as u32 * 25 + 128) >> 8) as u8 + 16;
            return match format.pixel_format {
                PixelFormat::Yuyv4 => [y, 128, y, 128]
                    .iter()
                    .copied()
                    .cycle()
                    .take(format.frame_size())
                    .collect(),
                _ => {
                    let luma = format.width as usize * format.height as usize;
                    let mut data = vec![y; luma];
                    data.resize(format.frame_size(), 128);
                    data
                }
            };
        }
    };
    pixel
        .iter()
        .copied()
        .cycle()
        .take(format.frame_size())
        .collect()
}

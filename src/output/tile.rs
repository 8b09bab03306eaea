//! Software tile codec
//!
//! Key units carry the whole canvas as one JPEG. Delta units carry only the
//! 64x64 tiles whose content hash changed since the previous composite.
//!
//! Payload layout (all integers big endian):
//!
//! ```text
//! width u16 | height u16 | count u32 | count x region
//! region = x u16 | y u16 | w u16 | h u16 | len u32 | jpeg[len]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, ImageFormat, RgbaImage};
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

use crate::capture::frame::{Frame, FrameFormat, PixelFormat};
use crate::error::{Error, Result};
use crate::output::encoder::{EncodedUnit, Encoder};

pub const TILE_SIZE: u32 = 64;
const MIN_QUALITY: u8 = 20;
const MAX_QUALITY: u8 = 95;
const START_QUALITY: u8 = 80;
const QUALITY_STEP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

pub struct TileEncoder {
    format: FrameFormat,
    keyframe_interval: u64,
    /// Bytes per unit that keep the stream at the configured bitrate
    target_bytes: usize,
    quality: u8,
    average_bytes: usize,
    frames: u64,
    hashes: Vec<u64>,
}

impl TileEncoder {
    pub fn new(
        format: FrameFormat,
        fps: u32,
        bitrate: u32,
        keyframe_interval: u32,
    ) -> Result<Self> {
        if format.pixel_format != PixelFormat::Rgba {
            return Err(Error::EncoderUnavailable(format!(
                "tile codec needs rgba input, got {:?}",
                format.pixel_format
            )));
        }
        if format.width > u16::MAX as u32 || format.height > u16::MAX as u32 {
            return Err(Error::EncoderUnavailable(format!(
                "canvas {}x{} too large for jpeg",
                format.width, format.height
            )));
        }

        let target_bytes = (bitrate as usize / 8 / fps.max(1) as usize).max(1);
        debug!(
            "Tile encoder: {}x{}, key every {} frames, {} bytes/unit target",
            format.width, format.height, keyframe_interval, target_bytes
        );

        Ok(Self {
            format,
            keyframe_interval: keyframe_interval.max(1) as u64,
            target_bytes,
            quality: START_QUALITY,
            average_bytes: target_bytes,
            frames: 0,
            hashes: Vec::new(),
        })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn tiles(&self) -> impl Iterator<Item = Region> + '_ {
        let (width, height) = (self.format.width, self.format.height);
        (0..height).step_by(TILE_SIZE as usize).flat_map(move |y| {
            (0..width).step_by(TILE_SIZE as usize).map(move |x| Region {
                x,
                y,
                w: TILE_SIZE.min(width - x),
                h: TILE_SIZE.min(height - y),
            })
        })
    }

    fn hash_region(&self, data: &[u8], region: Region) -> u64 {
        let stride = self.format.width as usize * 4;
        let mut hasher = Xxh3::new();
        for row in region.y..region.y + region.h {
            let start = row as usize * stride + region.x as usize * 4;
            hasher.update(&data[start..start + region.w as usize * 4]);
        }
        hasher.digest()
    }

    fn encode_region(&self, data: &[u8], region: Region) -> Result<Vec<u8>> {
        let stride = self.format.width as usize * 4;
        let mut rgb = Vec::with_capacity(region.w as usize * region.h as usize * 3);
        for row in region.y..region.y + region.h {
            let start = row as usize * stride + region.x as usize * 4;
            for px in data[start..start + region.w as usize * 4].chunks_exact(4) {
                rgb.extend_from_slice(&px[..3]);
            }
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(&rgb, region.w, region.h, ExtendedColorType::Rgb8)
            .map_err(|e| Error::Encoder(e.to_string()))?;
        Ok(jpeg)
    }

    /// Nudge JPEG quality toward the per-unit byte budget.
    fn adapt_quality(&mut self, unit_len: usize) {
        self.average_bytes = (self.average_bytes * 7 + unit_len) / 8;
        if self.average_bytes > self.target_bytes + self.target_bytes / 10 {
            self.quality = self.quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
        } else if self.average_bytes < self.target_bytes * 4 / 5 {
            self.quality = (self.quality + QUALITY_STEP).min(MAX_QUALITY);
        }
    }
}

impl Encoder for TileEncoder {
    fn name(&self) -> &'static str {
        "tile"
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedUnit>> {
        if frame.format() != self.format || frame.data.len() != self.format.frame_size() {
            return Err(Error::Encoder(format!(
                "expected {:?}, got {:?} ({} bytes)",
                self.format,
                frame.format(),
                frame.data.len()
            )));
        }
        let data = &frame.data[..];

        let key = self.frames % self.keyframe_interval == 0;
        self.frames += 1;

        let tiles: Vec<Region> = self.tiles().collect();
        let hashes: Vec<u64> = tiles.iter().map(|&t| self.hash_region(data, t)).collect();
        let regions: Vec<Region> = if key {
            vec![Region {
                x: 0,
                y: 0,
                w: self.format.width,
                h: self.format.height,
            }]
        } else {
            tiles
                .iter()
                .zip(&hashes)
                .enumerate()
                .filter(|(i, (_, hash))| self.hashes.get(*i) != Some(*hash))
                .map(|(_, (&tile, _))| tile)
                .collect()
        };
        self.hashes = hashes;

        let mut payload = BytesMut::new();
        payload.put_u16(self.format.width as u16);
        payload.put_u16(self.format.height as u16);
        payload.put_u32(regions.len() as u32);
        for region in &regions {
            let jpeg = self.encode_region(data, *region)?;
            payload.put_u16(region.x as u16);
            payload.put_u16(region.y as u16);
            payload.put_u16(region.w as u16);
            payload.put_u16(region.h as u16);
            payload.put_u32(jpeg.len() as u32);
            payload.put_slice(&jpeg);
        }

        trace!(
            "Unit {}: key={} regions={} bytes={} q={}",
            frame.sequence(),
            key,
            regions.len(),
            payload.len(),
            self.quality
        );
        self.adapt_quality(payload.len());

        Ok(vec![EncodedUnit {
            data: payload.freeze(),
            key,
            sequence: frame.sequence(),
        }])
    }
}

/// Rebuilds the canvas from a tile stream; what a reader would run.
#[derive(Default)]
pub struct TileDecoder {
    canvas: Option<RgbaImage>,
}

impl TileDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canvas(&self) -> Option<&RgbaImage> {
        self.canvas.as_ref()
    }

    pub fn apply(&mut self, unit: &EncodedUnit) -> Result<()> {
        let malformed = || Error::Encoder("truncated tile unit".into());
        let mut payload = &unit.data[..];
        if payload.remaining() < 8 {
            return Err(malformed());
        }
        let width = payload.get_u16() as u32;
        let height = payload.get_u16() as u32;
        let count = payload.get_u32();

        if unit.key {
            self.canvas = Some(RgbaImage::new(width, height));
        }
        let canvas = self
            .canvas
            .as_mut()
            .ok_or_else(|| Error::Encoder("delta unit before first key unit".into()))?;

        for _ in 0..count {
            if payload.remaining() < 12 {
                return Err(malformed());
            }
            let x = payload.get_u16() as i64;
            let y = payload.get_u16() as i64;
            let _w = payload.get_u16();
            let _h = payload.get_u16();
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(malformed());
            }
            let tile = image::load_from_memory_with_format(&payload[..len], ImageFormat::Jpeg)
                .map_err(|e| Error::Encoder(e.to_string()))?
                .to_rgba8();
            payload.advance(len);
            imageops::replace(canvas, &tile, x, y);
        }
        Ok(())
    }
}

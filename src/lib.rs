//! Live video mosaic: M raw frame streams composited into one tiled, encoded output.
//!
//! ```text
//! SourceIngest -> FormatNormalizer -> SlotSelector -> GridCompositor -> Encoder -> OutputSink
//! ```
//!
//! The graph is built once by [`Pipeline`]; at runtime only routing updates
//! ([`Pipeline::set_route`]) and lifecycle transitions happen.

pub mod capture;
mod error;
mod event;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::frame::{Frame, FrameFormat, FrameMetadata, PixelFormat};
pub use capture::source::{Liveness, SourceStats};
pub use error::{Error, Result};
pub use event::{PipelineEvent, Severity};
pub use output::encoder::{EncodedUnit, Encoder};
pub use pipeline::controller::{Pipeline, PipelineState, PipelineStats};
pub use pipeline::geometry::Geometry;
pub use pipeline::routing::RoutingAssignment;
pub use pipeline::selector::SelectorState;

use crate::utils::{default_fifo_path, default_source_name};

/// System configuration
///
/// Static for the lifetime of a pipeline. Per-source settings are explicit
/// records rather than process environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grid: GridConfig,
    pub sources: Vec<SourceConfig>,
    pub canvas: CanvasConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// N
    pub num_slots: usize,
    /// M, at least N
    pub num_sources: usize,
    pub cols: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    /// Path, `tcp://host:port` or `pattern://n`
    pub locator: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
    /// Output ticks per second
    pub fps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCodec {
    /// Software JPEG tile codec
    Tile,
    /// H.264 through GStreamer (`gstreamer-pipeline` feature)
    H264,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub host: String,
    pub port: u16,
    pub codec: OutputCodec,
    /// Target bits per second
    pub bitrate: u32,
    /// Frames between key units
    pub keyframe_interval: u32,
    /// Fail construction when no hardware encoder is present
    pub require_hardware: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderMode {
    /// Repeat the last frame from the routed source, solid color if none
    LastGood,
    Solid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered between stages
    pub queue_capacity: usize,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub stall_timeout_ms: u64,
    /// Format errors before a source is marked failed
    pub format_error_threshold: u64,
    pub placeholder: PlaceholderMode,
    pub placeholder_color: [u8; 4],
    /// Encoded units buffered per output reader
    pub reader_buffer: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            num_slots: 4,
            num_sources: 4,
            cols: 2,
            rows: 2,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            locator: String::new(),
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::Rgba,
            fps: 30,
        }
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 3840,
            height: 2160,
            fps: 30,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 6000,
            codec: OutputCodec::Tile,
            bitrate: 8_000_000,
            keyframe_interval: 30,
            require_hardware: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            reconnect_backoff_ms: 500,
            max_backoff_ms: 5000,
            stall_timeout_ms: 2000,
            format_error_threshold: 30,
            placeholder: PlaceholderMode::LastGood,
            placeholder_color: [16, 16, 16, 255],
            reader_buffer: 64,
        }
    }
}

impl CanvasConfig {
    /// One output frame period
    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

impl PipelineConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.reconnect_backoff_ms))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Config {
    /// Load defaults, then an optional TOML file, then `TILER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TILER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Per-source records with names and locators filled in.
    ///
    /// An empty `sources` list expands to `num_sources` FIFO sources.
    pub fn resolved_sources(&self) -> Vec<SourceConfig> {
        let mut sources = if self.sources.is_empty() {
            vec![SourceConfig::default(); self.grid.num_sources]
        } else {
            self.sources.clone()
        };

        for (i, source) in sources.iter_mut().enumerate() {
            if source.name.is_empty() {
                source.name = default_source_name(i);
            }
            if source.locator.is_empty() {
                source.locator = default_fifo_path(&source.name).display().to_string();
            }
        }
        sources
    }

    /// Check everything that must hold before a graph is built.
    pub fn validate(&self) -> Result<Geometry> {
        let geometry = Geometry::new(
            self.grid.num_slots,
            self.grid.num_sources,
            self.grid.cols,
            self.grid.rows,
            self.canvas.width,
            self.canvas.height,
        )?;

        let sources = self.resolved_sources();
        if sources.len() != geometry.num_sources {
            return Err(Error::InvalidConfig(format!(
                "{} sources configured but num_sources is {}",
                sources.len(),
                geometry.num_sources
            )));
        }
        for source in &sources {
            if source.width == 0 || source.height == 0 || source.fps == 0 {
                return Err(Error::InvalidConfig(format!(
                    "source {} has an empty format",
                    source.name
                )));
            }
            utils::Locator::parse(&source.locator)?;
        }

        if self.canvas.fps == 0 {
            return Err(Error::InvalidConfig("canvas fps must be non-zero".into()));
        }
        if self.output.bitrate == 0 || self.output.keyframe_interval == 0 {
            return Err(Error::InvalidConfig(
                "bitrate and keyframe_interval must be non-zero".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 || self.pipeline.reader_buffer == 0 {
            return Err(Error::InvalidConfig("queue sizes must be non-zero".into()));
        }

        Ok(geometry)
    }
}

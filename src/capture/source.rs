//! Source identity and liveness tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use serde::Serialize;

use crate::capture::frame::FrameFormat;
use crate::utils::Locator;
use crate::SourceConfig;

/// Liveness of a source as seen by its ingest adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Liveness {
    /// Not opened yet
    Unknown,
    /// Transport open, no frame read yet
    Available,
    Streaming,
    /// No frame within the stall timeout
    Stalled,
    /// Transport missing or closed; reopen is pending
    Unavailable,
    /// Too many format errors; never reopened
    Failed,
}

impl Liveness {
    /// True when frames are expected to arrive.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Available | Self::Streaming)
    }
}

/// One live raw-video producer, shared between its ingest task and observers.
pub struct Source {
    pub index: usize,
    pub name: String,
    pub locator: Locator,
    pub format: FrameFormat,
    pub fps: u32,
    liveness: AtomicCell<Liveness>,
    stats: CachePadded<SourceCounters>,
}

#[derive(Default)]
struct SourceCounters {
    frames_read: AtomicU64,
    format_errors: AtomicU64,
    normalize_errors: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Snapshot of per-source counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub frames_read: u64,
    pub format_errors: u64,
    pub normalize_errors: u64,
    pub frames_dropped: u64,
}

pub type SourceHandle = Arc<Source>;

impl Source {
    pub fn new(index: usize, config: &SourceConfig, locator: Locator) -> Self {
        Self {
            index,
            name: config.name.clone(),
            locator,
            format: FrameFormat::new(config.width, config.height, config.pixel_format),
            fps: config.fps,
            liveness: AtomicCell::new(Liveness::Unknown),
            stats: CachePadded::new(SourceCounters::default()),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.load()
    }

    /// Stores `next`, returning the previous value when it changed.
    ///
    /// `Failed` is sticky: once failed the source stays failed.
    pub fn set_liveness(&self, next: Liveness) -> Option<Liveness> {
        let mut prev = self.liveness.load();
        loop {
            if prev == next || prev == Liveness::Failed {
                return None;
            }
            match self.liveness.compare_exchange(prev, next) {
                Ok(old) => return Some(old),
                Err(current) => prev = current,
            }
        }
    }

    pub fn record_frame(&self) {
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of format errors so far.
    pub fn record_format_error(&self) -> u64 {
        self.stats.format_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_normalize_error(&self) -> u64 {
        self.stats.normalize_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_dropped(&self, count: u64) {
        self.stats.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            format_errors: self.stats.format_errors.load(Ordering::Relaxed),
            normalize_errors: self.stats.normalize_errors.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("locator", &self.locator)
            .field("liveness", &self.liveness())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;

    fn source() -> Source {
        let config = SourceConfig {
            name: "apphost1".into(),
            locator: "pattern://0".into(),
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Rgba,
            fps: 30,
        };
        Source::new(0, &config, Locator::Pattern(0))
    }

    #[test]
    fn test_liveness_transitions() {
        let src = source();
        assert_eq!(src.liveness(), Liveness::Unknown);
        assert_eq!(src.set_liveness(Liveness::Available), Some(Liveness::Unknown));
        assert_eq!(src.set_liveness(Liveness::Available), None);
        assert!(src.liveness().is_live());
    }

    #[test]
    fn test_failed_is_sticky() {
        let src = source();
        src.set_liveness(Liveness::Failed);
        assert_eq!(src.set_liveness(Liveness::Streaming), None);
        assert_eq!(src.liveness(), Liveness::Failed);
    }

    #[test]
    fn test_format_error_count() {
        let src = source();
        assert_eq!(src.record_format_error(), 1);
        assert_eq!(src.record_format_error(), 2);
        assert_eq!(src.stats().format_errors, 2);
    }
}

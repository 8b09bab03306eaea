//! Routing and compositing stages.
//!
//! ```text
//! Ingest -> FrameQueue -> Normalizer -> SourceFeed (per source)
//!                                          |  (N x M static table)
//!                                     SlotSelector (per slot) -> flume
//!                                          -> GridCompositor -> flume -> Encoder
//! ```
//!
//! Every hop is bounded; a full hop drops its oldest frame.

pub mod compositor;
pub mod controller;
pub mod geometry;
pub mod ringbuf;
pub mod routing;
pub mod selector;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tokio::sync::broadcast;

use crate::capture::frame::Frame;

pub use compositor::GridCompositor;
pub use controller::{Pipeline, PipelineState, PipelineStats};
pub use geometry::Geometry;
pub use ringbuf::FrameQueue;
pub use routing::{RoutingAssignment, RoutingMatrix};
pub use selector::{SelectorState, SlotSelector};

/// Send `item` on a bounded channel, evicting the oldest queued items when
/// the channel is full. Returns how many items were evicted.
///
/// `evict` must be a receiver of the same channel.
pub(crate) fn push_latest<T>(tx: &flume::Sender<T>, evict: &flume::Receiver<T>, item: T) -> u64 {
    let mut item = item;
    let mut evicted = 0;
    loop {
        match tx.try_send(item) {
            Ok(()) => return evicted,
            Err(flume::TrySendError::Full(back)) => {
                item = back;
                if evict.try_recv().is_ok() {
                    evicted += 1;
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => return evicted,
        }
    }
}

/// Normalized output of one source: the live stream plus its newest frame.
///
/// Late subscribers (a slot that was just switched here) start from
/// `latest` instead of waiting for the next frame.
#[derive(Clone)]
pub struct SourceFeed {
    frames: broadcast::Sender<Frame>,
    latest: Arc<ArcSwapOption<Frame>>,
}

impl SourceFeed {
    pub fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity.max(1));
        Self {
            frames,
            latest: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub fn publish(&self, frame: Frame) {
        self.latest.store(Some(Arc::new(frame.clone())));
        // No subscribers just means no slot shows this source right now
        let _ = self.frames.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.latest.load_full().map(|frame| Frame::clone(&frame))
    }

    #[cfg(test)]
    pub fn receiver_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

/// Counters shared by all stages of one pipeline.
#[derive(Default)]
pub(crate) struct Counters {
    pub ticks: CachePadded<AtomicU64>,
    pub stale_frames: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub units_encoded: AtomicU64,
    pub key_units: AtomicU64,
    pub warnings: AtomicU64,
    pub readers: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

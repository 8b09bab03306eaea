//! Bounded frame queue that drops the oldest frame when full

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::sync::Notify;

use crate::Frame;

/// Per-source queue between the ingest adapter and the normalizer.
///
/// A slow consumer never blocks the producer: pushing into a full queue
/// overwrites the oldest frame, so memory stays bounded and per-source order
/// is kept.
pub struct FrameQueue {
    ring: Mutex<HeapRb<Frame>>,
    ready: Notify,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            ready: Notify::new(),
            capacity: capacity.max(1),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: push a frame, returns false if the oldest frame was dropped
    pub fn push(&self, frame: Frame) -> bool {
        let dropped = self
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_overwrite(frame)
            .is_some();

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        !dropped
    }

    /// Consumer: pop the oldest frame without waiting
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_pop();
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Consumer: wait up to `wait` for a frame
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(written, read, dropped)`
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameFormat;
    use bytes::Bytes;
    use std::sync::Arc;

    fn frame(seq: u64) -> Frame {
        Frame::new(Bytes::from_static(&[0; 4]), Some(0), seq, FrameFormat::rgba(1, 1))
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let queue = FrameQueue::new(3);
        for seq in 0..3 {
            assert!(queue.push(frame(seq)));
        }
        assert!(!queue.push(frame(3)));
        assert_eq!(queue.len(), 3);

        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(queue.stats(), (4, 3, 1));
    }

    #[tokio::test]
    async fn test_pop_timeout_empty() {
        let queue = FrameQueue::new(2);
        assert!(queue.pop_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(2));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(frame(9));
        });
        let got = queue.pop_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.sequence(), 9);
    }
}

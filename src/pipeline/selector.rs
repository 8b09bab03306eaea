//! Per-slot source selection
//!
//! Every slot owns a static table holding a handle to every normalized
//! source stream. Switching sources only swaps which subscription the slot
//! reads from; the graph itself never changes at runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument};

use crate::capture::frame::{Frame, FrameFormat, FrameMetadata};
use crate::capture::source::SourceHandle;
use crate::event::{EventSender, PipelineEvent};
use crate::pipeline::routing::RoutingMatrix;
use crate::pipeline::{push_latest, Counters, SourceFeed};
use crate::PlaceholderMode;

/// Where a selector is in its switch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectorState {
    Idle,
    Attached(usize),
    /// Discarding what is still buffered from `from` before reading `to`
    Switching { from: usize, to: usize },
}

/// Selects, for one output slot, which normalized source feeds it.
pub struct SlotSelector {
    slot: usize,
    candidates: Arc<[SourceFeed]>,
    sources: Arc<[SourceHandle]>,
    routing: Arc<RoutingMatrix>,
    output: flume::Sender<Frame>,
    evict: flume::Receiver<Frame>,
    cell: FrameFormat,
    placeholder: Bytes,
    mode: PlaceholderMode,
    /// How long to wait for a frame before filling the slot
    patience: Duration,
    events: EventSender,
    counters: Arc<Counters>,
    state: watch::Sender<SelectorState>,
    last_good: Option<Frame>,
}

impl SlotSelector {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slot: usize,
        candidates: Arc<[SourceFeed]>,
        sources: Arc<[SourceHandle]>,
        routing: Arc<RoutingMatrix>,
        output: flume::Sender<Frame>,
        evict: flume::Receiver<Frame>,
        cell: FrameFormat,
        placeholder_color: [u8; 4],
        mode: PlaceholderMode,
        patience: Duration,
        events: EventSender,
        counters: Arc<Counters>,
    ) -> Self {
        let placeholder = Frame::solid(cell, placeholder_color, None).data;
        let (state, _) = watch::channel(SelectorState::Idle);
        Self {
            slot,
            candidates,
            sources,
            routing,
            output,
            evict,
            cell,
            placeholder,
            mode,
            patience,
            events,
            counters,
            state,
            last_good: None,
        }
    }

    /// Follows the selector's state for as long as it runs.
    pub fn watch_state(&self) -> watch::Receiver<SelectorState> {
        self.state.subscribe()
    }

    fn current(&self) -> Option<usize> {
        match *self.state.borrow() {
            SelectorState::Attached(source) => Some(source),
            SelectorState::Switching { to, .. } => Some(to),
            SelectorState::Idle => None,
        }
    }

    /// Move the slot over to source `to`.
    ///
    /// The old subscription is drained and dropped first, so nothing from
    /// the old source reaches the slot afterwards. The new source's newest
    /// frame goes out immediately instead of waiting for its next one.
    fn switch(
        &mut self,
        old: Option<broadcast::Receiver<Frame>>,
        to: usize,
    ) -> broadcast::Receiver<Frame> {
        let from = self.current();
        if let (Some(from), Some(mut old)) = (from, old) {
            self.state.send_replace(SelectorState::Switching { from, to });
            let mut discarded = 0;
            loop {
                match old.try_recv() {
                    Ok(_) => discarded += 1,
                    Err(TryRecvError::Lagged(skipped)) => discarded += skipped,
                    Err(_) => break,
                }
            }
            Counters::add(&self.counters.stale_frames, discarded);
        }

        let feed = &self.candidates[to];
        let upstream = feed.subscribe();
        self.last_good = feed.latest();
        self.state.send_replace(SelectorState::Attached(to));

        match from {
            Some(from) => {
                info!("Slot {} switched from source {} to {}", self.slot, from, to);
                self.events.emit(PipelineEvent::SlotSwitched {
                    slot: self.slot,
                    source: to,
                });
            }
            None => debug!("Slot {} attached to source {}", self.slot, to),
        }

        if !self.sources[to].liveness().is_live() {
            self.forward(self.fill(to));
        } else if let Some(frame) = self.last_good.clone() {
            self.forward(frame);
        }
        upstream
    }

    fn forward(&self, frame: Frame) {
        let evicted = push_latest(&self.output, &self.evict, frame);
        Counters::add(&self.counters.dropped_frames, evicted);
    }

    /// What the slot shows while its source is not delivering.
    fn fill(&self, source: usize) -> Frame {
        if self.mode == PlaceholderMode::LastGood {
            if let Some(frame) = &self.last_good {
                return frame.clone();
            }
        }
        Frame {
            data: self.placeholder.clone(),
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                source: Some(source),
                format: self.cell,
                placeholder: true,
            }),
            timestamp: Instant::now(),
        }
    }

    #[instrument(skip_all, fields(slot = self.slot))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut route_changes = self.routing.subscribe();
        let initial = self.routing.snapshot().source_for(self.slot).unwrap_or(0);
        let mut upstream = self.switch(None, initial);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let routed = self.routing.snapshot().source_for(self.slot);
            if let (Some(routed), Some(current)) = (routed, self.current()) {
                if routed != current {
                    upstream = self.switch(Some(upstream), routed);
                }
            }
            let Some(source) = self.current() else {
                break;
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = route_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = tokio::time::timeout(self.patience, upstream.recv()) => received,
            };

            match received {
                Ok(Ok(frame)) => {
                    self.last_good = Some(frame.clone());
                    self.forward(frame);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!("Slot {} skipped {} frames of source {}", self.slot, skipped, source);
                    Counters::add(&self.counters.dropped_frames, skipped);
                }
                Ok(Err(RecvError::Closed)) => {
                    // Normalizer is gone; keep the slot filled until shutdown
                    tokio::time::sleep(self.patience).await;
                    self.forward(self.fill(source));
                }
                Err(_) => {
                    if !self.sources[source].liveness().is_live() {
                        self.forward(self.fill(source));
                    }
                }
            }
        }

        self.state.send_replace(SelectorState::Idle);
        debug!("Slot {} selector stopped", self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::{Liveness, Source};
    use crate::utils::Locator;
    use crate::SourceConfig;

    struct Harness {
        feeds: Arc<[SourceFeed]>,
        sources: Arc<[SourceHandle]>,
        routing: Arc<RoutingMatrix>,
        output: flume::Receiver<Frame>,
        events: flume::Receiver<PipelineEvent>,
        states: watch::Receiver<SelectorState>,
        counters: Arc<Counters>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn stop(self) {
            self.shutdown.send_replace(true);
            self.task.await.unwrap();
        }
    }

    fn cell() -> FrameFormat {
        FrameFormat::rgba(2, 2)
    }

    fn frame(source: usize, seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![source as u8; 16]), Some(source), seq, cell())
    }

    /// Feeds and sources are set up first; `prepare` runs before the
    /// selector task starts so it sees them from its first attach.
    fn start<F>(num_sources: usize, mode: PlaceholderMode, prepare: F) -> Harness
    where
        F: FnOnce(&[SourceFeed], &[SourceHandle]),
    {
        let feeds: Vec<_> = (0..num_sources).map(|_| SourceFeed::new(8)).collect();
        let feeds: Arc<[_]> = feeds.into();
        let sources: Vec<SourceHandle> = (0..num_sources)
            .map(|i| {
                Arc::new(Source::new(
                    i,
                    &SourceConfig::default(),
                    Locator::Pattern(i as u32),
                ))
            })
            .collect();
        let sources: Arc<[_]> = sources.into();
        prepare(&feeds, &sources);

        let routing = Arc::new(RoutingMatrix::new(1, num_sources));
        let (tx, rx) = flume::bounded(4);
        let (events_tx, events_rx) = crate::event::event_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let selector = SlotSelector::new(
            0,
            feeds.clone(),
            sources.clone(),
            routing.clone(),
            tx,
            rx.clone(),
            cell(),
            [1, 2, 3, 255],
            mode,
            Duration::from_millis(20),
            events_tx,
            counters.clone(),
        );
        let states = selector.watch_state();
        let task = tokio::spawn(selector.run(shutdown_rx));

        Harness {
            feeds,
            sources,
            routing,
            output: rx,
            events: events_rx,
            states,
            counters,
            shutdown: shutdown_tx,
            task,
        }
    }

    fn streaming(_: &[SourceFeed], sources: &[SourceHandle]) {
        for source in sources {
            source.set_liveness(Liveness::Streaming);
        }
    }

    async fn next(rx: &flume::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_state(states: &mut watch::Receiver<SelectorState>, want: SelectorState) {
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_forwards_routed_source() {
        let mut h = start(2, PlaceholderMode::Solid, streaming);
        wait_state(&mut h.states, SelectorState::Attached(0)).await;

        h.feeds[0].publish(frame(0, 1));
        let got = next(&h.output).await;
        assert_eq!(got.source(), Some(0));
        assert_eq!(got.sequence(), 1);
        assert!(!got.is_placeholder());

        h.stop().await;
    }

    #[tokio::test]
    async fn test_switch_drops_old_source() {
        let mut h = start(2, PlaceholderMode::Solid, streaming);
        wait_state(&mut h.states, SelectorState::Attached(0)).await;

        h.routing.route(0, 1).unwrap();
        wait_state(&mut h.states, SelectorState::Attached(1)).await;
        assert_eq!(h.feeds[0].receiver_count(), 0);
        assert_eq!(h.feeds[1].receiver_count(), 1);

        h.feeds[0].publish(frame(0, 2));
        h.feeds[1].publish(frame(1, 3));
        let got = next(&h.output).await;
        assert_eq!(got.source(), Some(1));
        assert_eq!(got.sequence(), 3);

        let switched = h
            .events
            .drain()
            .any(|e| e == PipelineEvent::SlotSwitched { slot: 0, source: 1 });
        assert!(switched);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_switch_starts_from_newest_frame() {
        let mut h = start(2, PlaceholderMode::Solid, |feeds, sources| {
            streaming(feeds, sources);
            // Source 1 produced before anyone watched it
            feeds[1].publish(frame(1, 41));
            feeds[1].publish(frame(1, 42));
        });
        wait_state(&mut h.states, SelectorState::Attached(0)).await;

        h.routing.route(0, 1).unwrap();
        let got = next(&h.output).await;
        assert_eq!(got.source(), Some(1));
        assert_eq!(got.sequence(), 42);
        assert!(!got.is_placeholder());

        h.stop().await;
    }

    #[tokio::test]
    async fn test_state_follows_switches() {
        let h = start(3, PlaceholderMode::Solid, streaming);
        let mut states = h.states.clone();
        wait_state(&mut states, SelectorState::Attached(0)).await;

        h.routing.route(0, 2).unwrap();
        wait_state(&mut states, SelectorState::Attached(2)).await;
        h.routing.route(0, 1).unwrap();
        wait_state(&mut states, SelectorState::Attached(1)).await;

        h.shutdown.send_replace(true);
        h.task.await.unwrap();
        assert_eq!(*states.borrow(), SelectorState::Idle);
        assert_eq!(Counters::get(&h.counters.stale_frames), 0);
    }

    #[tokio::test]
    async fn test_placeholder_for_dead_source() {
        let h = start(1, PlaceholderMode::Solid, |_, sources| {
            sources[0].set_liveness(Liveness::Unavailable);
        });

        let got = next(&h.output).await;
        assert!(got.is_placeholder());
        assert_eq!(got.source(), Some(0));
        assert_eq!(got.pixel(1, 1), Some([1, 2, 3, 255]));

        h.stop().await;
    }

    #[tokio::test]
    async fn test_last_good_repeated_after_loss() {
        let mut h = start(1, PlaceholderMode::LastGood, streaming);
        wait_state(&mut h.states, SelectorState::Attached(0)).await;

        h.feeds[0].publish(frame(0, 5));
        assert_eq!(next(&h.output).await.sequence(), 5);

        h.sources[0].set_liveness(Liveness::Stalled);
        let repeated = next(&h.output).await;
        assert_eq!(repeated.sequence(), 5);
        assert!(!repeated.is_placeholder());

        h.stop().await;
    }
}

//! Fixed-cadence grid compositor
//!
//! Once per output tick the compositor takes one routing snapshot, collects
//! one frame per slot and pastes each into its cell. A slot that delivers
//! nothing in time keeps its previous frame, provided that frame came from
//! the source the slot is routed to right now; a slot that was just
//! rerouted starts from the new source's newest frame.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

use crate::capture::frame::{Frame, FrameFormat};
use crate::capture::source::SourceHandle;
use crate::pipeline::geometry::Geometry;
use crate::pipeline::routing::{RoutingAssignment, RoutingMatrix};
use crate::pipeline::{push_latest, Counters, SourceFeed};
use crate::PlaceholderMode;

/// Paste `cells[slot]` into a fresh RGBA canvas at each slot's offset.
///
/// Every cell must already be in the geometry's cell format.
pub fn compose_canvas(geometry: &Geometry, cells: &[&Frame]) -> Vec<u8> {
    let canvas_stride = geometry.canvas_width as usize * 4;
    let cell_stride = geometry.cell_width as usize * 4;
    let mut canvas = vec![0u8; geometry.canvas_format().frame_size()];

    for (slot, cell) in cells.iter().enumerate().take(geometry.num_slots) {
        let (x, y) = geometry.offset(slot);
        let origin = y as usize * canvas_stride + x as usize * 4;
        for (row, line) in cell
            .data
            .chunks_exact(cell_stride)
            .take(geometry.cell_height as usize)
            .enumerate()
        {
            let start = origin + row * canvas_stride;
            canvas[start..start + cell_stride].copy_from_slice(line);
        }
    }
    canvas
}

/// Cut the cell of `slot` back out of a composite. Inverse of [`compose_canvas`].
pub fn extract_cell(geometry: &Geometry, canvas: &[u8], slot: usize) -> Vec<u8> {
    let canvas_stride = geometry.canvas_width as usize * 4;
    let cell_stride = geometry.cell_width as usize * 4;
    let (x, y) = geometry.offset(slot);
    let origin = y as usize * canvas_stride + x as usize * 4;

    let mut cell = Vec::with_capacity(geometry.cell_format().frame_size());
    for row in 0..geometry.cell_height as usize {
        let start = origin + row * canvas_stride;
        cell.extend_from_slice(&canvas[start..start + cell_stride]);
    }
    cell
}

pub struct GridCompositor {
    geometry: Geometry,
    routing: Arc<RoutingMatrix>,
    inputs: Vec<flume::Receiver<Frame>>,
    feeds: Arc<[SourceFeed]>,
    sources: Arc<[SourceHandle]>,
    output: flume::Sender<Frame>,
    evict: flume::Receiver<Frame>,
    tap: broadcast::Sender<Frame>,
    placeholder: Frame,
    mode: PlaceholderMode,
    tick: Duration,
    counters: Arc<Counters>,
    previous: Vec<Option<Frame>>,
    sequence: u64,
}

impl GridCompositor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        geometry: Geometry,
        routing: Arc<RoutingMatrix>,
        inputs: Vec<flume::Receiver<Frame>>,
        feeds: Arc<[SourceFeed]>,
        sources: Arc<[SourceHandle]>,
        output: flume::Sender<Frame>,
        evict: flume::Receiver<Frame>,
        tap: broadcast::Sender<Frame>,
        placeholder_color: [u8; 4],
        mode: PlaceholderMode,
        tick: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        let placeholder = Frame::solid(geometry.cell_format(), placeholder_color, None);
        let previous = vec![None; geometry.num_slots];
        Self {
            geometry,
            routing,
            inputs,
            feeds,
            sources,
            output,
            evict,
            tap,
            placeholder,
            mode,
            tick,
            counters,
            previous,
            sequence: 0,
        }
    }

    /// Collect slot frames until `deadline`. Returns `None` on shutdown.
    async fn collect(
        &self,
        assignment: &RoutingAssignment,
        deadline: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Vec<Option<Frame>>> {
        let mut chosen: Vec<Option<Frame>> = vec![None; self.geometry.num_slots];

        for (slot, input) in self.inputs.iter().enumerate() {
            let want = assignment.source_for(slot);
            loop {
                let received = tokio::select! {
                    _ = shutdown.changed() => return None,
                    received = tokio::time::timeout_at(deadline, input.recv_async()) => received,
                };
                match received {
                    Ok(Ok(frame)) if frame.source() == want => {
                        chosen[slot] = Some(frame);
                        break;
                    }
                    Ok(Ok(_)) => Counters::add(&self.counters.stale_frames, 1),
                    Ok(Err(_)) | Err(_) => break,
                }
            }

            // Anything queued behind the chosen frame is newer; keep the latest
            let mut superseded = 0;
            for frame in input.try_iter() {
                if frame.source() == want {
                    if chosen[slot].replace(frame).is_some() {
                        superseded += 1;
                    }
                } else {
                    Counters::add(&self.counters.stale_frames, 1);
                }
            }
            Counters::add(&self.counters.dropped_frames, superseded);
        }

        Some(chosen)
    }

    /// Newest frame of `source`, if the slot may show it right now.
    fn newest(&self, source: usize) -> Option<Frame> {
        let live = self.sources.get(source)?.liveness().is_live();
        if live || self.mode == PlaceholderMode::LastGood {
            self.feeds.get(source)?.latest()
        } else {
            None
        }
    }

    /// Build the composite for this tick, falling back per slot.
    fn assemble(&mut self, assignment: &RoutingAssignment, chosen: Vec<Option<Frame>>) -> Frame {
        let cell_format = self.geometry.cell_format();
        let mut cells: Vec<Frame> = Vec::with_capacity(self.geometry.num_slots);

        for (slot, fresh) in chosen.into_iter().enumerate() {
            let want = assignment.source_for(slot);
            let frame = match fresh {
                Some(frame) if frame.format() == cell_format => Some(frame),
                Some(frame) => {
                    debug!(
                        "Slot {} got {:?} instead of the cell format, dropped",
                        slot,
                        frame.format()
                    );
                    None
                }
                None => None,
            };
            let frame = frame
                .or_else(|| {
                    self.previous[slot]
                        .as_ref()
                        .filter(|prev| prev.source() == want)
                        .cloned()
                })
                .or_else(|| want.and_then(|source| self.newest(source)))
                .unwrap_or_else(|| self.placeholder.clone());

            self.previous[slot] = Some(frame.clone());
            cells.push(frame);
        }

        let refs: Vec<&Frame> = cells.iter().collect();
        let canvas = compose_canvas(&self.geometry, &refs);
        self.sequence += 1;
        Frame::new(
            Bytes::from(canvas),
            None,
            self.sequence,
            FrameFormat::rgba(self.geometry.canvas_width, self.geometry.canvas_height),
        )
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Compositor started: {}x{} grid on {}x{} at {:?}/tick",
            self.geometry.cols,
            self.geometry.rows,
            self.geometry.canvas_width,
            self.geometry.canvas_height,
            self.tick
        );

        let mut next_tick = Instant::now() + self.tick;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let assignment = self.routing.snapshot();
            let Some(chosen) = self.collect(&assignment, next_tick, &mut shutdown).await else {
                break;
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep_until(next_tick) => {}
            }

            let composite = self.assemble(&assignment, chosen);
            trace!("Composite {} ready", composite.sequence());
            let _ = self.tap.send(composite.clone());
            let evicted = push_latest(&self.output, &self.evict, composite);
            Counters::add(&self.counters.dropped_frames, evicted);
            Counters::add(&self.counters.ticks, 1);

            next_tick += self.tick;
            let now = Instant::now();
            if next_tick < now {
                // Fell behind: skip missed ticks rather than bursting
                next_tick = now + self.tick;
            }
        }

        info!("Compositor stopped after {} composites", self.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(4, 4, 2, 2, 4, 4).unwrap()
    }

    fn cell(source: usize, value: u8) -> Frame {
        Frame::new(
            Bytes::from(vec![value; 16]),
            Some(source),
            1,
            FrameFormat::rgba(2, 2),
        )
    }

    #[test]
    fn test_compose_places_cells() {
        let g = geometry();
        let cells: Vec<Frame> = (0..4).map(|i| cell(i, 10 * (i as u8 + 1))).collect();
        let refs: Vec<&Frame> = cells.iter().collect();
        let canvas = compose_canvas(&g, &refs);
        let frame = Frame::new(Bytes::from(canvas), None, 1, FrameFormat::rgba(4, 4));

        assert_eq!(frame.pixel(0, 0), Some([10; 4]));
        assert_eq!(frame.pixel(3, 0), Some([20; 4]));
        assert_eq!(frame.pixel(1, 3), Some([30; 4]));
        assert_eq!(frame.pixel(2, 2), Some([40; 4]));
    }

    #[test]
    fn test_extract_inverts_compose() {
        let g = geometry();
        let cells: Vec<Frame> = (0..4)
            .map(|i| {
                let data: Vec<u8> = (0..16).map(|b| (i * 16 + b) as u8).collect();
                Frame::new(Bytes::from(data), Some(i), 1, FrameFormat::rgba(2, 2))
            })
            .collect();
        let refs: Vec<&Frame> = cells.iter().collect();
        let canvas = compose_canvas(&g, &refs);
        for (slot, frame) in cells.iter().enumerate() {
            assert_eq!(extract_cell(&g, &canvas, slot), frame.data.to_vec());
        }
    }

    struct Harness {
        routing: Arc<RoutingMatrix>,
        inputs: Vec<flume::Sender<Frame>>,
        feeds: Arc<[SourceFeed]>,
        output: flume::Receiver<Frame>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        use crate::capture::source::{Liveness, Source};
        use crate::utils::Locator;
        use crate::SourceConfig;

        let g = geometry();
        let routing = Arc::new(RoutingMatrix::new(4, 4));
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..4).map(|_| flume::bounded(4)).unzip();
        let feeds: Arc<[SourceFeed]> = (0..4).map(|_| SourceFeed::new(4)).collect();
        let sources: Arc<[SourceHandle]> = (0..4)
            .map(|i| {
                let source = Source::new(i, &SourceConfig::default(), Locator::Pattern(i as u32));
                source.set_liveness(Liveness::Streaming);
                Arc::new(source)
            })
            .collect();
        let (tx, rx) = flume::bounded(8);
        let (tap, _) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let compositor = GridCompositor::new(
            g,
            routing.clone(),
            receivers,
            feeds.clone(),
            sources,
            tx,
            rx.clone(),
            tap,
            [7, 7, 7, 255],
            PlaceholderMode::Solid,
            Duration::from_millis(10),
            Arc::new(Counters::default()),
        );
        let task = tokio::spawn(compositor.run(shutdown_rx));
        Harness {
            routing,
            inputs: senders,
            feeds,
            output: rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn next(rx: &flume::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_slots_show_placeholder() {
        let h = start();
        let first = next(&h.output).await;
        assert_eq!(first.source(), None);
        assert_eq!(first.format(), FrameFormat::rgba(4, 4));
        assert_eq!(first.pixel(0, 0), Some([7, 7, 7, 255]));
        assert_eq!(first.pixel(3, 3), Some([7, 7, 7, 255]));

        let second = next(&h.output).await;
        assert!(second.sequence() > first.sequence());

        h.shutdown.send_replace(true);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_source_never_shown() {
        let h = start();
        h.inputs[0].send(cell(0, 50)).unwrap();
        let mut composite = next(&h.output).await;
        while composite.pixel(0, 0) != Some([50; 4]) {
            composite = next(&h.output).await;
        }

        // Slot 0 now belongs to source 2: the old frame is not reused
        h.routing.route(0, 2).unwrap();
        while composite.pixel(0, 0) != Some([7, 7, 7, 255]) {
            composite = next(&h.output).await;
        }

        // and a late frame from source 0 is discarded
        h.inputs[0].send(cell(0, 60)).unwrap();
        for _ in 0..3 {
            let composite = next(&h.output).await;
            assert_ne!(composite.pixel(0, 0), Some([60; 4]));
        }

        h.inputs[0].send(cell(2, 90)).unwrap();
        let mut composite = next(&h.output).await;
        while composite.pixel(1, 1) != Some([90; 4]) {
            composite = next(&h.output).await;
        }

        h.shutdown.send_replace(true);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reroute_shows_new_source_next_tick() {
        let h = start();
        // Source 3 streams but no selector has forwarded anything yet
        h.feeds[3].publish(cell(3, 33));
        let before = next(&h.output).await;
        assert_eq!(before.pixel(0, 0), Some([7, 7, 7, 255]));

        h.routing.route(0, 3).unwrap();
        let _ = h.output.drain().count();
        // The first composite may have been assembled before the route
        // change; the one after it must show the new source
        let first = next(&h.output).await;
        assert!(matches!(
            first.pixel(0, 0),
            Some([7, 7, 7, 255]) | Some([33, 33, 33, 33])
        ));
        let second = next(&h.output).await;
        assert_eq!(second.pixel(0, 0), Some([33; 4]));

        h.shutdown.send_replace(true);
        h.task.await.unwrap();
    }
}

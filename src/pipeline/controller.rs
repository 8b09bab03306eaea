//! Pipeline controller: graph construction, lifecycle and the event monitor

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capture::frame::Frame;
use crate::capture::ingest::{IngestAdapter, IngestSettings};
use crate::capture::normalize::run_normalizer;
use crate::capture::source::{Liveness, Source, SourceHandle, SourceStats};
use crate::error::{Error, Result};
use crate::event::{event_channel, EventSender, PipelineEvent, Severity};
use crate::output::encoder::{create_encoder, run_encoder, EncodedUnit, Encoder};
use crate::output::sink::OutputSink;
use crate::pipeline::compositor::GridCompositor;
use crate::pipeline::geometry::Geometry;
use crate::pipeline::ringbuf::FrameQueue;
use crate::pipeline::routing::{RoutingAssignment, RoutingMatrix};
use crate::pipeline::selector::{SelectorState, SlotSelector};
use crate::pipeline::{Counters, SourceFeed};
use crate::utils::Locator;
use crate::Config;

/// Upper bound on how long `stop` waits for stages to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a pipeline. `Stopped` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    Constructing,
    Ready,
    Running,
    Draining,
    Stopped,
    Faulted,
}

/// Point-in-time counters for the whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Output ticks, one composite each
    pub ticks: u64,
    pub units_encoded: u64,
    pub key_units: u64,
    pub frames_dropped: u64,
    /// Frames discarded because their slot had been rerouted
    pub stale_frames: u64,
    pub warnings: u64,
    pub readers: u64,
    pub sources: Vec<SourceStats>,
}

/// A built mosaic pipeline.
///
/// The graph is wired once in [`Pipeline::start`]: M ingest/normalize
/// branches, N slot selectors each able to read any of the M branches, one
/// compositor, one encoder thread and one output sink. Afterwards only
/// routing updates and lifecycle transitions happen.
pub struct Pipeline {
    config: Config,
    geometry: Geometry,
    sources: Arc<[SourceHandle]>,
    routing: Arc<RoutingMatrix>,
    encoder: Option<Box<dyn Encoder>>,

    state: Arc<watch::Sender<PipelineState>>,
    shutdown: Arc<watch::Sender<bool>>,
    monitor_halt: watch::Sender<bool>,

    events: EventSender,
    event_rx: Option<flume::Receiver<PipelineEvent>>,
    observers: broadcast::Sender<PipelineEvent>,
    composites: broadcast::Sender<Frame>,
    counters: Arc<Counters>,

    stages: Vec<JoinHandle<()>>,
    selector_states: Vec<watch::Receiver<SelectorState>>,
    monitor: Option<JoinHandle<()>>,
    encoder_thread: Option<std::thread::JoinHandle<()>>,
    output_addr: Option<SocketAddr>,
}

impl Pipeline {
    /// Validate `config` and construct the configured encoder.
    ///
    /// Any failure here (bad geometry, missing encoder) means the pipeline
    /// never reaches `Ready`.
    pub fn build(config: Config) -> Result<Self> {
        let result = config.validate().and_then(|geometry| {
            let encoder =
                create_encoder(&config.output, geometry.canvas_format(), config.canvas.fps)?;
            Ok((geometry, encoder))
        });
        match result {
            Ok((_, encoder)) => Self::build_with_encoder(config, encoder),
            Err(e) => {
                error!("Pipeline construction failed (Faulted): {}", e);
                Err(e)
            }
        }
    }

    /// Like [`Pipeline::build`] with a caller-supplied encoder.
    pub fn build_with_encoder(config: Config, encoder: Box<dyn Encoder>) -> Result<Self> {
        let (state, _) = watch::channel(PipelineState::Constructing);
        match Self::construct(config, encoder, state) {
            Ok(pipeline) => Ok(pipeline),
            Err(e) => {
                error!("Pipeline construction failed (Faulted): {}", e);
                Err(e)
            }
        }
    }

    fn construct(
        config: Config,
        encoder: Box<dyn Encoder>,
        state: watch::Sender<PipelineState>,
    ) -> Result<Self> {
        let geometry = config.validate()?;

        let sources = config
            .resolved_sources()
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let locator = Locator::parse(&source.locator)?;
                Ok(Arc::new(Source::new(index, source, locator)))
            })
            .collect::<Result<Vec<_>>>()?;

        let routing = Arc::new(RoutingMatrix::new(geometry.num_slots, geometry.num_sources));
        let (events, event_rx) = event_channel();
        let (observers, _) = broadcast::channel(256);
        let (composites, _) = broadcast::channel(4);
        let (shutdown, _) = watch::channel(false);
        let (monitor_halt, _) = watch::channel(false);

        state.send_replace(PipelineState::Ready);
        info!(
            "Pipeline ready: {} slots ({}x{}), {} sources, encoder {}",
            geometry.num_slots,
            geometry.cols,
            geometry.rows,
            geometry.num_sources,
            encoder.name()
        );

        Ok(Self {
            config,
            geometry,
            sources: sources.into(),
            routing,
            encoder: Some(encoder),
            state: Arc::new(state),
            shutdown: Arc::new(shutdown),
            monitor_halt,
            events,
            event_rx: Some(event_rx),
            observers,
            composites,
            counters: Arc::new(Counters::default()),
            stages: Vec::new(),
            selector_states: Vec::new(),
            monitor: None,
            encoder_thread: None,
            output_addr: None,
        })
    }

    /// Wire every stage and start producing output. `Ready -> Running`.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != PipelineState::Ready {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        }
        let (Some(encoder), Some(event_rx)) = (self.encoder.take(), self.event_rx.take()) else {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        };

        let monitor = Monitor {
            events: event_rx,
            observers: self.observers.clone(),
            sources: self.sources.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            counters: self.counters.clone(),
        };
        self.monitor = Some(tokio::spawn(monitor.run(self.monitor_halt.subscribe())));

        let pipeline = &self.config.pipeline;
        let capacity = pipeline.queue_capacity;
        let (units, _) = broadcast::channel::<Arc<EncodedUnit>>(pipeline.reader_buffer);
        let addr = format!("{}:{}", self.config.output.host, self.config.output.port);
        let sink = match OutputSink::bind(
            &addr,
            units.clone(),
            self.events.clone(),
            self.counters.clone(),
        )
        .await
        {
            Ok(sink) => sink,
            Err(e) => {
                self.fault(&format!("output bind on {} failed: {}", addr, e));
                return Err(e);
            }
        };
        self.output_addr = sink.local_addr().ok();

        let tick = self.config.canvas.tick();
        let cell = self.geometry.cell_format();
        let settings = IngestSettings {
            reconnect_backoff: pipeline.reconnect_backoff(),
            max_backoff: pipeline.max_backoff(),
            stall_timeout: pipeline.stall_timeout(),
            format_error_threshold: pipeline.format_error_threshold,
        };
        let placeholder_color = pipeline.placeholder_color;
        let placeholder_mode = pipeline.placeholder;

        // Source branches: ingest -> queue -> normalizer -> feed
        let sources = self.sources.clone();
        let mut feeds = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            let queue = Arc::new(FrameQueue::new(capacity));
            let feed = SourceFeed::new(capacity);
            feeds.push(feed.clone());

            let adapter = IngestAdapter::new(
                source.clone(),
                queue.clone(),
                self.events.clone(),
                settings.clone(),
            );
            self.spawn_stage(
                format!("ingest-{}", source.index),
                adapter.run(self.shutdown.subscribe()),
            );
            self.spawn_stage(
                format!("normalize-{}", source.index),
                run_normalizer(
                    source.clone(),
                    queue,
                    feed,
                    cell,
                    self.events.clone(),
                    self.shutdown.subscribe(),
                    tick,
                ),
            );
        }
        let feeds: Arc<[SourceFeed]> = feeds.into();

        // Slot selectors, each wired to every source
        let mut slot_inputs = Vec::with_capacity(self.geometry.num_slots);
        self.selector_states.clear();
        for slot in 0..self.geometry.num_slots {
            let (tx, rx) = flume::bounded(capacity);
            let selector = SlotSelector::new(
                slot,
                feeds.clone(),
                self.sources.clone(),
                self.routing.clone(),
                tx,
                rx.clone(),
                cell,
                placeholder_color,
                placeholder_mode,
                tick,
                self.events.clone(),
                self.counters.clone(),
            );
            self.selector_states.push(selector.watch_state());
            self.spawn_stage(
                format!("selector-{}", slot),
                selector.run(self.shutdown.subscribe()),
            );
            slot_inputs.push(rx);
        }

        let (composite_tx, composite_rx) = flume::bounded(capacity);
        let compositor = GridCompositor::new(
            self.geometry,
            self.routing.clone(),
            slot_inputs,
            feeds,
            self.sources.clone(),
            composite_tx,
            composite_rx.clone(),
            self.composites.clone(),
            placeholder_color,
            placeholder_mode,
            tick,
            self.counters.clone(),
        );
        self.spawn_stage("compositor".into(), compositor.run(self.shutdown.subscribe()));

        let encoder_thread = {
            let events = self.events.clone();
            let counters = self.counters.clone();
            let units = units.clone();
            std::thread::Builder::new()
                .name("tiler-encoder".into())
                .spawn(move || run_encoder(encoder, composite_rx, units, events, counters))
        };
        match encoder_thread {
            Ok(handle) => self.encoder_thread = Some(handle),
            Err(e) => {
                self.fault(&format!("failed to spawn encoder thread: {}", e));
                return Err(e.into());
            }
        }
        drop(units);

        self.spawn_stage("output".into(), sink.run(self.shutdown.subscribe()));

        let started = self.state.send_if_modified(|state| {
            if *state == PipelineState::Ready {
                *state = PipelineState::Running;
                true
            } else {
                false
            }
        });
        if started {
            info!(
                "Pipeline running, output on {}",
                self.output_addr
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| addr.clone())
            );
        }
        Ok(())
    }

    fn spawn_stage<F>(&mut self, stage: String, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let events = self.events.clone();
        self.stages.push(tokio::spawn(async move {
            future.await;
            events.emit(PipelineEvent::StageExited { stage });
        }));
    }

    fn fault(&self, reason: &str) {
        enter_faulted(&self.state, &self.shutdown, reason);
    }

    /// Route `slot` to `source`. Returns whether the mapping changed.
    ///
    /// Only allowed while `Ready` or `Running`. Repeating a call with the
    /// same arguments changes nothing and emits nothing.
    pub fn set_route(&self, slot: usize, source: usize) -> Result<bool> {
        let state = self.state();
        if !matches!(state, PipelineState::Ready | PipelineState::Running) {
            return Err(Error::InvalidState {
                operation: "set_route",
                state,
            });
        }

        match self.routing.route(slot, source)? {
            Some(from) => {
                self.events.emit(PipelineEvent::RouteChanged {
                    slot,
                    from,
                    to: source,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn routing(&self) -> RoutingAssignment {
        RoutingAssignment::clone(&self.routing.snapshot())
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Resolves once the state satisfies `pred`, returning that state.
    pub async fn wait_for_state<F>(&self, pred: F) -> PipelineState
    where
        F: Fn(PipelineState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Graceful stop: `Running -> Draining -> Stopped`.
    ///
    /// Stages see the shutdown signal at their next wait; frames already
    /// handed to the encoder are still encoded and sent. A faulted pipeline
    /// is torn down the same way but stays `Faulted`.
    pub async fn stop(&mut self) -> Result<()> {
        let state = self.state();
        match state {
            PipelineState::Running => {
                self.state.send_replace(PipelineState::Draining);
                info!("Pipeline draining");
            }
            PipelineState::Ready | PipelineState::Faulted => {}
            PipelineState::Stopped => return Ok(()),
            PipelineState::Constructing | PipelineState::Draining => {
                return Err(Error::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }
        self.shutdown.send_replace(true);

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        for mut stage in self.stages.drain(..) {
            if tokio::time::timeout_at(deadline, &mut stage).await.is_err() {
                warn!("Stage did not stop in time, aborting");
                stage.abort();
            }
        }

        if let Some(thread) = self.encoder_thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join());
            match tokio::time::timeout_at(deadline, joined).await {
                Ok(Ok(Ok(()))) => {}
                Ok(_) => warn!("Encoder thread panicked"),
                Err(_) => warn!("Encoder thread did not stop in time"),
            }
        }

        self.monitor_halt.send_replace(true);
        if let Some(mut monitor) = self.monitor.take() {
            if tokio::time::timeout_at(deadline, &mut monitor).await.is_err() {
                monitor.abort();
            }
        }

        let stopped = self.state.send_if_modified(|state| {
            if matches!(*state, PipelineState::Ready | PipelineState::Draining) {
                *state = PipelineState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            info!("Pipeline stopped");
        } else {
            info!("Pipeline torn down in state {:?}", self.state());
        }
        Ok(())
    }

    /// Bound output address, once started.
    pub fn output_addr(&self) -> Option<SocketAddr> {
        self.output_addr
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Per-slot selector state; all `Idle` until started.
    pub fn slot_states(&self) -> Vec<SelectorState> {
        if self.selector_states.is_empty() {
            return vec![SelectorState::Idle; self.geometry.num_slots];
        }
        self.selector_states.iter().map(|rx| *rx.borrow()).collect()
    }

    pub fn source_liveness(&self) -> Vec<Liveness> {
        self.sources.iter().map(|s| s.liveness()).collect()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            ticks: Counters::get(&c.ticks),
            units_encoded: Counters::get(&c.units_encoded),
            key_units: Counters::get(&c.key_units),
            frames_dropped: Counters::get(&c.dropped_frames),
            stale_frames: Counters::get(&c.stale_frames),
            warnings: Counters::get(&c.warnings),
            readers: Counters::get(&c.readers),
            sources: self.sources.iter().map(|s| s.stats()).collect(),
        }
    }

    /// Every event the monitor has classified, in order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.observers.subscribe()
    }

    /// Raw composites as they leave the compositor.
    pub fn subscribe_composite(&self) -> broadcast::Receiver<Frame> {
        self.composites.subscribe()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.monitor_halt.send_replace(true);
        for stage in &self.stages {
            stage.abort();
        }
        if let Some(monitor) = &self.monitor {
            monitor.abort();
        }
    }
}

fn enter_faulted(
    state: &watch::Sender<PipelineState>,
    shutdown: &watch::Sender<bool>,
    reason: &str,
) {
    let faulted = state.send_if_modified(|state| {
        if matches!(
            *state,
            PipelineState::Ready | PipelineState::Running | PipelineState::Draining
        ) {
            *state = PipelineState::Faulted;
            true
        } else {
            false
        }
    });
    if faulted {
        error!("Pipeline faulted: {}", reason);
    }
    shutdown.send_replace(true);
}

/// Sole consumer of the event channel.
struct Monitor {
    events: flume::Receiver<PipelineEvent>,
    observers: broadcast::Sender<PipelineEvent>,
    sources: Arc<[SourceHandle]>,
    state: Arc<watch::Sender<PipelineState>>,
    shutdown: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl Monitor {
    async fn run(self, mut halt: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                received = self.events.recv_async() => match received {
                    Ok(event) => self.handle(event),
                    Err(_) => break,
                },
                _ = halt.changed() => {
                    for event in self.events.try_iter() {
                        self.handle(event);
                    }
                    break;
                }
            }
        }
        debug!("Event monitor stopped");
    }

    fn handle(&self, event: PipelineEvent) {
        let severity = event.severity();
        match severity {
            Severity::Info => debug!("{:?}", event),
            Severity::Warning => {
                warn!("{:?}", event);
                Counters::add(&self.counters.warnings, 1);
                metrics::counter!("tiler_warnings_total", "kind" => event.kind()).increment(1);
            }
            Severity::Fatal => error!("{:?}", event),
        }

        let all_lost = matches!(
            event,
            PipelineEvent::SourceStateChanged {
                to: Liveness::Failed,
                ..
            }
        ) && self
            .sources
            .iter()
            .all(|s| s.liveness() == Liveness::Failed);

        let reason = format!("{:?}", event);
        let _ = self.observers.send(event);

        if all_lost {
            error!("All {} sources failed", self.sources.len());
            let _ = self.observers.send(PipelineEvent::AllSourcesLost);
            enter_faulted(&self.state, &self.shutdown, "all sources lost");
        } else if severity == Severity::Fatal {
            enter_faulted(&self.state, &self.shutdown, &reason);
        }
    }
}

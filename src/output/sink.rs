//! TCP output sink
//!
//! Every connected reader gets its own subscription to the encoded stream
//! and its own task, so a slow reader only ever loses its own units.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::event::{EventSender, PipelineEvent};
use crate::output::encoder::EncodedUnit;
use crate::pipeline::Counters;

pub struct OutputSink {
    listener: TcpListener,
    units: broadcast::Sender<Arc<EncodedUnit>>,
    events: EventSender,
    counters: Arc<Counters>,
}

impl OutputSink {
    pub async fn bind(
        addr: &str,
        units: broadcast::Sender<Arc<EncodedUnit>>,
        events: EventSender,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Output listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            units,
            events,
            counters,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept readers until shutdown, then wait for their streams to end.
    ///
    /// Readers finish once the encoder drops its side of the stream, so
    /// units encoded during drain still go out.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            listener,
            units,
            events,
            counters,
        } = self;
        let mut readers = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("Reader connected: {}", addr);
                        Counters::add(&counters.readers, 1);
                        events.emit(PipelineEvent::ReaderConnected { addr });
                        readers.spawn(serve_reader(
                            stream,
                            addr,
                            units.subscribe(),
                            events.clone(),
                            counters.clone(),
                        ));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                Some(_) = readers.join_next(), if !readers.is_empty() => {}
            }
        }

        drop(listener);
        drop(units);
        while readers.join_next().await.is_some() {}
        debug!("Output sink stopped");
    }
}

/// Forward units to one reader, starting at a key unit.
///
/// A reader that falls behind loses the units it missed and is resynced at
/// the next key unit.
async fn serve_reader(
    mut stream: TcpStream,
    addr: SocketAddr,
    mut units: broadcast::Receiver<Arc<EncodedUnit>>,
    events: EventSender,
    counters: Arc<Counters>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay on {} failed: {}", addr, e);
    }

    let mut synced = false;
    let reason = loop {
        match units.recv().await {
            Ok(unit) => {
                if !synced {
                    if !unit.key {
                        continue;
                    }
                    synced = true;
                }
                let written = async {
                    stream.write_all(&unit.header()).await?;
                    stream.write_all(&unit.data).await
                }
                .await;
                if let Err(e) = written {
                    break e.to_string();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Reader {} lagged by {} units, resyncing", addr, skipped);
                events.emit(PipelineEvent::ReaderLagged { addr, skipped });
                synced = false;
            }
            Err(RecvError::Closed) => break "stream ended".to_string(),
        }
    };

    let _ = stream.shutdown().await;
    counters.readers.fetch_sub(1, Ordering::Relaxed);
    info!("Reader disconnected: {} ({})", addr, reason);
    events.emit(PipelineEvent::ReaderDisconnected { addr, reason });
}

//! Source ingest adapter: raw fixed-size frame records from a transport

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::Frame;
use crate::capture::pattern::PatternGenerator;
use crate::capture::source::{Liveness, SourceHandle};
use crate::error::{Error, Result};
use crate::event::{EventSender, PipelineEvent};
use crate::pipeline::ringbuf::FrameQueue;
use crate::utils::Locator;

/// Retry and failure policy for one adapter.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub reconnect_backoff: Duration,
    pub max_backoff: Duration,
    /// Bounded wait for one frame before the source counts as stalled
    pub stall_timeout: Duration,
    pub format_error_threshold: u64,
}

enum Transport {
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Pattern(PatternGenerator),
}

/// An open transport plus the partially read frame, if any.
pub struct StreamHandle {
    transport: Transport,
    buf: BytesMut,
    filled: usize,
    sequence: u64,
}

/// Reads frames for one source and feeds its bounded queue.
pub struct IngestAdapter {
    source: SourceHandle,
    queue: Arc<FrameQueue>,
    events: EventSender,
    settings: IngestSettings,
}

impl IngestAdapter {
    pub fn new(
        source: SourceHandle,
        queue: Arc<FrameQueue>,
        events: EventSender,
        settings: IngestSettings,
    ) -> Self {
        Self {
            source,
            queue,
            events,
            settings,
        }
    }

    /// Open the source's transport.
    pub async fn open(&self) -> Result<StreamHandle> {
        let unavailable = |reason: String| Error::TransportUnavailable {
            source_index: self.source.index,
            locator: self.source.locator.to_string(),
            reason,
        };

        let transport = match &self.source.locator {
            Locator::Pattern(n) => {
                Transport::Pattern(PatternGenerator::new(*n, self.source.format, self.source.fps))
            }
            Locator::Tcp(addr) => {
                let connect = TcpStream::connect(addr);
                let stream = tokio::time::timeout(self.settings.stall_timeout, connect)
                    .await
                    .map_err(|_| unavailable("connect timed out".into()))?
                    .map_err(|e| unavailable(e.to_string()))?;
                Transport::Reader(Box::new(stream))
            }
            Locator::Path(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
                if is_fifo(&meta) {
                    Transport::Reader(open_fifo(path).map_err(|e| unavailable(e.to_string()))?)
                } else {
                    let file = tokio::fs::File::open(path)
                        .await
                        .map_err(|e| unavailable(e.to_string()))?;
                    Transport::Reader(Box::new(file))
                }
            }
        };

        let frame_size = self.source.format.frame_size();
        Ok(StreamHandle {
            transport,
            buf: BytesMut::zeroed(frame_size),
            filled: 0,
            sequence: 0,
        })
    }

    /// Read one frame.
    ///
    /// `Ok(None)` means the transport stayed silent for the whole stall
    /// timeout. Silence in the middle of a record means the producer went
    /// away mid-frame: the partial record is thrown away and reported as a
    /// format mismatch, so a restarted producer starts on a frame boundary.
    pub async fn read_frame(&self, handle: &mut StreamHandle) -> Result<Option<Frame>> {
        let frame_size = self.source.format.frame_size();
        let stall = self.settings.stall_timeout;
        let truncated = |actual: usize| Error::FormatMismatch {
            source_index: self.source.index,
            expected: frame_size,
            actual,
        };

        let data = match &mut handle.transport {
            Transport::Pattern(generator) => {
                match tokio::time::timeout(stall, generator.next_frame()).await {
                    Ok(data) => data,
                    Err(_) => return Ok(None),
                }
            }
            Transport::Reader(reader) => {
                while handle.filled < frame_size {
                    let buf = &mut handle.buf[handle.filled..];
                    let n = match tokio::time::timeout(stall, reader.read(buf)).await {
                        Err(_) if handle.filled == 0 => return Ok(None),
                        Err(_) => return Err(truncated(std::mem::take(&mut handle.filled))),
                        Ok(result) => result?,
                    };
                    if n == 0 {
                        let partial = std::mem::take(&mut handle.filled);
                        return Err(if partial == 0 {
                            Error::EndOfStream {
                                source_index: self.source.index,
                            }
                        } else {
                            truncated(partial)
                        });
                    }
                    handle.filled += n;
                }
                handle.filled = 0;
                let full = std::mem::replace(&mut handle.buf, BytesMut::zeroed(frame_size));
                full.freeze()
            }
        };

        if data.len() != frame_size {
            return Err(truncated(data.len()));
        }

        handle.sequence += 1;
        Ok(Some(Frame::new(
            data,
            Some(self.source.index),
            handle.sequence,
            self.source.format,
        )))
    }

    fn transition(&self, to: Liveness, reason: impl Into<String>) {
        if let Some(from) = self.source.set_liveness(to) {
            let reason = reason.into();
            if to.is_live() {
                info!("Source {} {:?} -> {:?}", self.source.index, from, to);
            } else {
                warn!("Source {} {:?} -> {:?}: {}", self.source.index, from, to, reason);
            }
            self.events.emit(PipelineEvent::SourceStateChanged {
                source: self.source.index,
                from,
                to,
                reason,
            });
        }
    }

    /// Adapter task: open with backoff, read until the transport goes away,
    /// repeat. Exits on shutdown or once the source is marked failed.
    #[instrument(skip_all, fields(source = self.source.index))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Ingest for source {} ({}) started",
            self.source.index, self.source.locator
        );
        let mut backoff = self.settings.reconnect_backoff;

        while !*shutdown.borrow() {
            let opened = tokio::select! {
                _ = shutdown.changed() => break,
                opened = self.open() => opened,
            };

            match opened {
                Ok(mut handle) => {
                    backoff = self.settings.reconnect_backoff;
                    self.transition(Liveness::Available, "transport opened");
                    match self.read_loop(&mut handle, &mut shutdown).await {
                        ReadExit::Shutdown | ReadExit::Failed => break,
                        ReadExit::Closed => {}
                    }
                }
                Err(e) => {
                    debug!("Source {} open failed: {}", self.source.index, e);
                    self.transition(Liveness::Unavailable, e.to_string());
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }

        info!("Ingest for source {} stopped", self.source.index);
    }

    async fn read_loop(
        &self,
        handle: &mut StreamHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadExit {
        let mut dropped: u64 = 0;

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => return ReadExit::Shutdown,
                result = self.read_frame(handle) => result,
            };

            match result {
                Ok(Some(frame)) => {
                    self.source.record_frame();
                    self.transition(Liveness::Streaming, "frames flowing");
                    if !self.queue.push(frame) {
                        dropped += 1;
                        self.source.record_dropped(1);
                        // One event per queue's worth of drops
                        if (dropped - 1) % self.queue.capacity() as u64 == 0 {
                            self.events.emit(PipelineEvent::FramesDropped {
                                stage: "ingest",
                                source: Some(self.source.index),
                                count: dropped,
                            });
                        }
                    }
                }
                Ok(None) => {
                    self.transition(Liveness::Stalled, "no frame within stall timeout");
                }
                Err(Error::FormatMismatch {
                    expected, actual, ..
                }) => {
                    let total = self.source.record_format_error();
                    warn!(
                        "Source {} dropped malformed frame ({} of {} bytes), {} format errors",
                        self.source.index, actual, expected, total
                    );
                    self.events.emit(PipelineEvent::FormatMismatch {
                        source: self.source.index,
                        expected,
                        actual,
                        total,
                    });
                    if total >= self.settings.format_error_threshold {
                        self.transition(
                            Liveness::Failed,
                            format!("{} format errors", total),
                        );
                        return ReadExit::Failed;
                    }
                }
                Err(e) => {
                    self.transition(Liveness::Unavailable, e.to_string());
                    return ReadExit::Closed;
                }
            }
        }
    }
}

enum ReadExit {
    Shutdown,
    Closed,
    Failed,
}

#[cfg(unix)]
fn is_fifo(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &std::fs::Metadata) -> bool {
    false
}

/// Opens a FIFO without blocking on a writer.
///
/// On Linux the read end is opened read-write so a departing writer shows
/// up as a stall instead of end-of-stream, and a new writer resumes it.
#[cfg(unix)]
fn open_fifo(path: &std::path::Path) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    let mut options = tokio::net::unix::pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    Ok(Box::new(options.open_receiver(path)?))
}

#[cfg(not(unix))]
fn open_fifo(_path: &std::path::Path) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "named pipes need a unix platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::Source;
    use crate::event::event_channel;
    use crate::{PixelFormat, SourceConfig};
    use std::io::Write;

    fn adapter(
        locator: Locator,
        threshold: u64,
    ) -> (IngestAdapter, flume::Receiver<PipelineEvent>) {
        let config = SourceConfig {
            name: "test".into(),
            locator: locator.to_string(),
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgba,
            fps: 100,
        };
        let source = Arc::new(Source::new(0, &config, locator));
        let (events, rx) = event_channel();
        let settings = IngestSettings {
            reconnect_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            stall_timeout: Duration::from_millis(100),
            format_error_threshold: threshold,
        };
        (
            IngestAdapter::new(source, Arc::new(FrameQueue::new(4)), events, settings),
            rx,
        )
    }

    #[tokio::test]
    async fn test_missing_path_is_unavailable() {
        let (adapter, _rx) = adapter(Locator::Path("/nonexistent/tiler.fifo".into()), 3);
        assert!(matches!(
            adapter.open().await,
            Err(Error::TransportUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_reads_fixed_size_records_then_truncation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // two full 16-byte frames and a 5-byte tail
        file.write_all(&[1u8; 16]).unwrap();
        file.write_all(&[2u8; 16]).unwrap();
        file.write_all(&[3u8; 5]).unwrap();
        file.flush().unwrap();

        let (adapter, _rx) = adapter(Locator::Path(file.path().to_path_buf()), 3);
        let mut handle = adapter.open().await.unwrap();

        let first = adapter.read_frame(&mut handle).await.unwrap().unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(&first.data[..], &[1u8; 16]);
        let second = adapter.read_frame(&mut handle).await.unwrap().unwrap();
        assert_eq!(second.sequence(), 2);

        assert!(matches!(
            adapter.read_frame(&mut handle).await,
            Err(Error::FormatMismatch {
                expected: 16,
                actual: 5,
                ..
            })
        ));
        assert!(matches!(
            adapter.read_frame(&mut handle).await,
            Err(Error::EndOfStream { .. })
        ));
    }

    #[tokio::test]
    async fn test_pattern_source_streams() {
        let (adapter, _rx) = adapter(Locator::Pattern(2), 3);
        let mut handle = adapter.open().await.unwrap();
        let frame = adapter.read_frame(&mut handle).await.unwrap().unwrap();
        assert_eq!(frame.source(), Some(0));
        assert_eq!(frame.data.len(), 16);
    }

    #[tokio::test]
    async fn test_repeated_format_errors_fail_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 3]).unwrap();
        file.flush().unwrap();

        let (adapter, rx) = adapter(Locator::Path(file.path().to_path_buf()), 2);
        let source = adapter.source.clone();
        let (_tx, shutdown) = watch::channel(false);

        // each reopen reads one truncated record
        tokio::time::timeout(Duration::from_secs(5), adapter.run(shutdown))
            .await
            .unwrap();

        assert_eq!(source.liveness(), Liveness::Failed);
        assert_eq!(source.stats().format_errors, 2);
        let failed = rx.drain().any(|e| {
            matches!(
                e,
                PipelineEvent::SourceStateChanged {
                    to: Liveness::Failed,
                    ..
                }
            )
        });
        assert!(failed);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_fifo_producer_restart_starts_on_frame_boundary() {
        use nix::sys::stat::Mode;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source0.fifo");
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let (adapter, _rx) = adapter(Locator::Path(path.clone()), 3);
        let mut handle = adapter.open().await.unwrap();
        let writer = || std::fs::OpenOptions::new().write(true).open(&path).unwrap();

        // First producer dies five bytes into a frame
        let mut first = writer();
        first.write_all(&[9u8; 5]).unwrap();
        drop(first);
        assert!(matches!(
            adapter.read_frame(&mut handle).await,
            Err(Error::FormatMismatch {
                expected: 16,
                actual: 5,
                ..
            })
        ));

        let mut second = writer();
        second.write_all(&[1u8; 16]).unwrap();
        second.write_all(&[2u8; 16]).unwrap();
        drop(second);
        let frame = adapter.read_frame(&mut handle).await.unwrap().unwrap();
        assert_eq!(&frame.data[..], &[1u8; 16]);
        let frame = adapter.read_frame(&mut handle).await.unwrap().unwrap();
        assert_eq!(&frame.data[..], &[2u8; 16]);

        // A writer leaving between frames is just a quiet pipe
        assert!(adapter.read_frame(&mut handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_frame_counts_as_format_error() {
        use tokio::io::AsyncWriteExt;

        let (adapter, rx) = adapter(Locator::Pattern(0), 3);
        let (mut producer, consumer) = tokio::io::duplex(64);
        let mut handle = StreamHandle {
            transport: Transport::Reader(Box::new(consumer)),
            buf: BytesMut::zeroed(16),
            filled: 0,
            sequence: 0,
        };
        let (_tx, mut shutdown) = watch::channel(false);

        producer.write_all(&[4u8; 7]).await.unwrap();
        let read = adapter.read_loop(&mut handle, &mut shutdown);
        // The stalled partial frame is counted; closing the writer ends the loop
        let closer = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(producer);
        };
        let (exit, _) = tokio::join!(read, closer);

        assert!(matches!(exit, ReadExit::Closed));
        assert_eq!(adapter.source.stats().format_errors, 1);
        assert!(rx.drain().any(|e| matches!(
            e,
            PipelineEvent::FormatMismatch {
                actual: 7,
                total: 1,
                ..
            }
        )));
    }
}

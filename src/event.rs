//! Pipeline events and their classification.
//!
//! Every stage sends typed records into one channel; the controller is the
//! only consumer. Warnings are logged and counted, fatal events fault the
//! pipeline.

use std::net::SocketAddr;

use serde::Serialize;

use crate::capture::source::Liveness;

/// How the controller reacts to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    /// Logged and counted, pipeline continues
    Warning,
    /// Pipeline transitions to Faulted
    Fatal,
}

/// Runtime events emitted by pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PipelineEvent {
    SourceStateChanged {
        source: usize,
        from: Liveness,
        to: Liveness,
        reason: String,
    },

    /// A frame was dropped because its size did not match the declared format.
    FormatMismatch {
        source: usize,
        expected: usize,
        actual: usize,
        total: u64,
    },

    /// A bounded queue discarded its oldest frames.
    FramesDropped {
        stage: &'static str,
        source: Option<usize>,
        count: u64,
    },

    NormalizeFailed {
        source: usize,
        reason: String,
    },

    RouteChanged {
        slot: usize,
        from: usize,
        to: usize,
    },

    /// A slot selector finished re-attaching to its newly routed source.
    SlotSwitched {
        slot: usize,
        source: usize,
    },

    ReaderConnected {
        addr: SocketAddr,
    },

    ReaderDisconnected {
        addr: SocketAddr,
        reason: String,
    },

    /// A reader fell behind and was resynchronised at the next key unit.
    ReaderLagged {
        addr: SocketAddr,
        skipped: u64,
    },

    EncoderFailed {
        reason: String,
    },

    AllSourcesLost,

    StageExited {
        stage: String,
    },
}

impl PipelineEvent {
    pub fn severity(&self) -> Severity {
        match self {
            Self::EncoderFailed { .. } | Self::AllSourcesLost => Severity::Fatal,
            Self::SourceStateChanged { to, .. } => match to {
                Liveness::Available | Liveness::Streaming => Severity::Info,
                Liveness::Unknown => Severity::Info,
                Liveness::Stalled | Liveness::Unavailable | Liveness::Failed => Severity::Warning,
            },
            Self::FormatMismatch { .. }
            | Self::FramesDropped { .. }
            | Self::NormalizeFailed { .. }
            | Self::ReaderLagged { .. } => Severity::Warning,
            Self::RouteChanged { .. }
            | Self::SlotSwitched { .. }
            | Self::ReaderConnected { .. }
            | Self::ReaderDisconnected { .. }
            | Self::StageExited { .. } => Severity::Info,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceStateChanged { .. } => "source_state",
            Self::FormatMismatch { .. } => "format_mismatch",
            Self::FramesDropped { .. } => "frames_dropped",
            Self::NormalizeFailed { .. } => "normalize_failed",
            Self::RouteChanged { .. } => "route_changed",
            Self::SlotSwitched { .. } => "slot_switched",
            Self::ReaderConnected { .. } => "reader_connected",
            Self::ReaderDisconnected { .. } => "reader_disconnected",
            Self::ReaderLagged { .. } => "reader_lagged",
            Self::EncoderFailed { .. } => "encoder_failed",
            Self::AllSourcesLost => "all_sources_lost",
            Self::StageExited { .. } => "stage_exited",
        }
    }
}

/// Sending half of the event channel handed to every stage.
#[derive(Clone)]
pub struct EventSender {
    tx: flume::Sender<PipelineEvent>,
}

/// Events buffered before stages start losing them
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub fn event_channel() -> (EventSender, flume::Receiver<PipelineEvent>) {
    let (tx, rx) = flume::bounded(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, rx)
}

impl EventSender {
    /// Never blocks; a full channel loses the event after logging it.
    pub fn emit(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                tracing::warn!("Event channel full, dropping {:?}", event);
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            PipelineEvent::EncoderFailed {
                reason: "oom".into()
            }
            .severity(),
            Severity::Fatal
        );
        assert_eq!(PipelineEvent::AllSourcesLost.severity(), Severity::Fatal);
        assert_eq!(
            PipelineEvent::SourceStateChanged {
                source: 2,
                from: Liveness::Unknown,
                to: Liveness::Unavailable,
                reason: "missing".into(),
            }
            .severity(),
            Severity::Warning
        );
        assert_eq!(
            PipelineEvent::RouteChanged {
                slot: 0,
                from: 0,
                to: 3
            }
            .severity(),
            Severity::Info
        );
    }

    #[test]
    fn test_emit_on_full_channel_does_not_block() {
        let (tx, rx) = flume::bounded(1);
        let sender = EventSender { tx };
        sender.emit(PipelineEvent::AllSourcesLost);
        sender.emit(PipelineEvent::AllSourcesLost);
        assert_eq!(rx.len(), 1);
    }
}

//! Error types for the tiler pipeline.
//!
//! Source-level errors (`TransportUnavailable`, `FormatMismatch`,
//! `EndOfStream`, `UnsupportedFormat`) are absorbed by the stage that hits
//! them and turned into degraded output. Construction and control errors are
//! returned to the caller. Runtime fatal conditions travel as
//! [`PipelineEvent`](crate::PipelineEvent)s instead.

use std::io;

/// Errors produced by the tiler pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source transport could not be opened.
    #[error("source {source_index} transport unavailable at {locator}: {reason}")]
    TransportUnavailable {
        source_index: usize,
        locator: String,
        reason: String,
    },

    /// A frame did not match the declared fixed-size format.
    #[error("source {source_index} frame size mismatch: expected {expected} bytes, got {actual}")]
    FormatMismatch {
        source_index: usize,
        expected: usize,
        actual: usize,
    },

    /// The transport closed cleanly at a frame boundary.
    #[error("source {source_index} reached end of stream")]
    EndOfStream { source_index: usize },

    /// The normalizer has no conversion for this pixel layout.
    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(crate::PixelFormat),

    #[error("invalid slot {slot} (pipeline has {num_slots} slots)")]
    InvalidSlot { slot: usize, num_slots: usize },

    #[error("invalid source {source_index} (pipeline has {num_sources} sources)")]
    InvalidSource {
        source_index: usize,
        num_sources: usize,
    },

    /// Grid geometry violates `N = cols * rows` or `M >= N`.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required encoder (or hardware capability) is missing.
    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    /// The encoder failed while producing output.
    #[error("encoder failed: {0}")]
    Encoder(String),

    /// The requested operation is not allowed in the current state.
    #[error("operation '{operation}' not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: crate::PipelineState,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

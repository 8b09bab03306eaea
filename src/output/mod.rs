//! Encoding and network output

pub mod encoder;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;
pub mod sink;
pub mod tile;

pub use encoder::{create_encoder, EncodedUnit, Encoder, UnitHeader};
pub use sink::OutputSink;
pub use tile::{TileDecoder, TileEncoder};

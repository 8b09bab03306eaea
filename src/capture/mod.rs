pub mod frame;
pub mod ingest;
pub mod normalize;
pub mod pattern;
pub mod source;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use ingest::IngestAdapter;
pub use source::{Liveness, Source};

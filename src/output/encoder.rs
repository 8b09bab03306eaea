//! Encoder seam and the blocking encode stage

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::capture::frame::{Frame, FrameFormat};
use crate::error::{Error, Result};
use crate::event::{EventSender, PipelineEvent};
use crate::pipeline::Counters;
use crate::{OutputCodec, OutputConfig};

/// Marker at the start of every unit on the wire
pub const UNIT_MAGIC: [u8; 2] = *b"TU";
pub const UNIT_HEADER_LEN: usize = 16;
const FLAG_KEY: u8 = 0x01;

/// One self-delimiting chunk of the encoded stream.
///
/// A key unit can be decoded without anything sent before it; a reader
/// joining mid-stream starts at the first key unit it sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub key: bool,
    /// Sequence of the composite this unit was produced from
    pub sequence: u64,
}

/// Decoded form of a wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    pub key: bool,
    pub sequence: u64,
    pub len: u32,
}

impl EncodedUnit {
    /// `magic[2] | flags u8 | reserved u8 | sequence u64 BE | length u32 BE`
    pub fn header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(UNIT_HEADER_LEN);
        buf.put_slice(&UNIT_MAGIC);
        buf.put_u8(if self.key { FLAG_KEY } else { 0 });
        buf.put_u8(0);
        buf.put_u64(self.sequence);
        buf.put_u32(self.data.len() as u32);
        buf.freeze()
    }
}

impl UnitHeader {
    pub fn parse(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < UNIT_HEADER_LEN || raw[..2] != UNIT_MAGIC {
            return None;
        }
        raw.advance(2);
        let flags = raw.get_u8();
        raw.advance(1);
        Some(Self {
            key: flags & FLAG_KEY != 0,
            sequence: raw.get_u64(),
            len: raw.get_u32(),
        })
    }
}

/// Turns composites into encoded units.
///
/// Implementations may buffer internally: one input frame can yield zero or
/// more units.
pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedUnit>>;

    /// Drain anything still buffered at end of stream.
    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        Ok(Vec::new())
    }
}

/// Build the encoder selected by `config` for composites of `canvas`.
pub fn create_encoder(
    config: &OutputConfig,
    canvas: FrameFormat,
    fps: u32,
) -> Result<Box<dyn Encoder>> {
    match config.codec {
        OutputCodec::Tile => {
            if config.require_hardware {
                return Err(Error::EncoderUnavailable(
                    "tile codec is software only".into(),
                ));
            }
            Ok(Box::new(crate::output::tile::TileEncoder::new(
                canvas,
                fps,
                config.bitrate,
                config.keyframe_interval,
            )?))
        }
        #[cfg(feature = "gstreamer-pipeline")]
        OutputCodec::H264 => Ok(Box::new(crate::output::gst::GstH264Encoder::new(
            canvas, fps, config,
        )?)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        OutputCodec::H264 => Err(Error::EncoderUnavailable(
            "h264 needs the gstreamer-pipeline feature".into(),
        )),
    }
}

/// Blocking encode loop, run on its own thread.
///
/// Consumes composites until the compositor hangs up, then flushes. Any
/// encoder error is fatal for the pipeline.
pub(crate) fn run_encoder(
    mut encoder: Box<dyn Encoder>,
    input: flume::Receiver<Frame>,
    output: broadcast::Sender<Arc<EncodedUnit>>,
    events: EventSender,
    counters: Arc<Counters>,
) {
    let name = encoder.name();
    info!("Encoder {} started", name);

    let publish = |units: Vec<EncodedUnit>| {
        for unit in units {
            Counters::add(&counters.units_encoded, 1);
            if unit.key {
                Counters::add(&counters.key_units, 1);
            }
            // No readers connected is fine
            let _ = output.send(Arc::new(unit));
        }
    };

    let fail = |e: Error| {
        error!("Encoder {} failed: {}", name, e);
        events.emit(PipelineEvent::EncoderFailed {
            reason: e.to_string(),
        });
    };

    while let Ok(frame) = input.recv() {
        match encoder.encode(&frame) {
            Ok(units) => publish(units),
            Err(e) => {
                fail(e);
                return;
            }
        }
    }

    debug!("Composite stream ended, flushing encoder");
    match encoder.flush() {
        Ok(units) => publish(units),
        Err(e) => fail(e),
    }
    info!("Encoder {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let unit = EncodedUnit {
            data: Bytes::from_static(b"abc"),
            key: true,
            sequence: 0x0102,
        };
        let header = unit.header();
        assert_eq!(header.len(), UNIT_HEADER_LEN);
        assert_eq!(&header[..4], &[b'T', b'U', 1, 0]);
        assert_eq!(&header[4..12], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&header[12..], &[0, 0, 0, 3]);

        let parsed = UnitHeader::parse(&header).unwrap();
        assert_eq!(
            parsed,
            UnitHeader {
                key: true,
                sequence: 0x0102,
                len: 3
            }
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(UnitHeader::parse(&[0u8; UNIT_HEADER_LEN]).is_none());
        assert!(UnitHeader::parse(b"TU").is_none());
    }

    #[cfg(not(feature = "gstreamer-pipeline"))]
    #[test]
    fn test_h264_needs_feature() {
        let config = OutputConfig {
            codec: OutputCodec::H264,
            ..OutputConfig::default()
        };
        assert!(matches!(
            create_encoder(&config, FrameFormat::rgba(64, 64), 30),
            Err(Error::EncoderUnavailable(_))
        ));
    }

    struct Failing;

    impl Encoder for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn encode(&mut self, _frame: &Frame) -> Result<Vec<EncodedUnit>> {
            Err(Error::Encoder("boom".into()))
        }
    }

    #[test]
    fn test_encode_error_reported() {
        let (tx, rx) = flume::bounded(1);
        let (units, _keep) = broadcast::channel(4);
        let (events, events_rx) = crate::event::event_channel();
        tx.send(Frame::solid(FrameFormat::rgba(2, 2), [0; 4], None))
            .unwrap();

        run_encoder(
            Box::new(Failing),
            rx,
            units,
            events,
            Arc::new(Counters::default()),
        );
        assert!(matches!(
            events_rx.try_recv(),
            Ok(PipelineEvent::EncoderFailed { .. })
        ));
    }
}

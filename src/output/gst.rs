//! GStreamer H.264 encoder with hardware element detection

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameFormat};
use crate::error::{Error, Result};
use crate::output::encoder::{EncodedUnit, Encoder};
use crate::OutputConfig;

/// Composites in, Annex-B H.264 access units out.
pub struct GstH264Encoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    frame_duration: gst::ClockTime,
}

impl GstH264Encoder {
    pub fn new(canvas: FrameFormat, fps: u32, config: &OutputConfig) -> Result<Self> {
        gst::init()
            .map_err(|e| Error::EncoderUnavailable(format!("GStreamer init failed: {}", e)))?;

        let (element, hardware) = Self::detect_h264_encoder()
            .ok_or_else(|| Error::EncoderUnavailable("no H.264 encoder element found".into()))?;
        if config.require_hardware && !hardware {
            return Err(Error::EncoderUnavailable(format!(
                "hardware encoding required but only {} is available",
                element
            )));
        }

        let pipeline_str = format!(
            "appsrc name=src is-live=true format=time ! \
             videoconvert ! \
             {} ! \
             h264parse config-interval=-1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=sink sync=false",
            Self::encoder_settings(element, config)
        );
        info!("Encoder pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| Error::EncoderUnavailable(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::EncoderUnavailable("failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<AppSrc>().ok())
            .ok_or_else(|| Error::EncoderUnavailable("failed to find appsrc".into()))?;
        let caps = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::Rgba,
            canvas.width,
            canvas.height,
        )
        .fps(gst::Fraction::new(fps.max(1) as i32, 1))
        .build()
        .and_then(|info| info.to_caps())
        .map_err(|e| Error::EncoderUnavailable(format!("bad canvas caps: {}", e)))?;
        appsrc.set_caps(Some(&caps));
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| Error::EncoderUnavailable("failed to find appsink".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::EncoderUnavailable(format!("failed to start pipeline: {:?}", e)))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            frame_duration: gst::ClockTime::from_nseconds(1_000_000_000 / fps.max(1) as u64),
        })
    }

    /// Best available H.264 encoder, hardware first. Returns `(element, hardware)`.
    fn detect_h264_encoder() -> Option<(&'static str, bool)> {
        let encoders = [
            ("nvv4l2h264enc", true), // NVIDIA Jetson / DeepStream
            ("vaapih264enc", true),  // Intel/AMD VAAPI
            ("v4l2h264enc", true),   // V4L2 M2M (Raspberry Pi and friends)
            ("x264enc", false),
        ];

        for (encoder, hardware) in encoders {
            if let Some(factory) = gst::ElementFactory::find(encoder) {
                info!(
                    "Found H.264 encoder: {} - {}",
                    encoder,
                    factory.metadata("long-name").unwrap_or("")
                );
                return Some((encoder, hardware));
            }
        }
        None
    }

    fn encoder_settings(element: &str, config: &OutputConfig) -> String {
        let kbps = (config.bitrate / 1000).max(1);
        match element {
            "nvv4l2h264enc" => format!(
                "nvv4l2h264enc bitrate={} iframeinterval={} insert-sps-pps=true",
                config.bitrate, config.keyframe_interval
            ),
            "vaapih264enc" => format!(
                "vaapih264enc bitrate={} keyframe-period={}",
                kbps, config.keyframe_interval
            ),
            "v4l2h264enc" => format!(
                "v4l2h264enc extra-controls=\"controls,video_bitrate={},h264_i_frame_period={}\"",
                config.bitrate, config.keyframe_interval
            ),
            _ => format!(
                "x264enc bitrate={} key-int-max={} tune=zerolatency speed-preset=ultrafast",
                kbps, config.keyframe_interval
            ),
        }
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        let kinds = [gst::MessageType::Error, gst::MessageType::Warning];
        while let Some(msg) = bus.pop_filtered(&kinds) {
            use gst::MessageView;

            match msg.view() {
                MessageView::Error(err) => {
                    return Err(Error::Encoder(format!(
                        "error from {:?}: {} ({:?})",
                        err.src().map(|s| s.path_string()),
                        err.error(),
                        err.debug()
                    )));
                }
                MessageView::Warning(warning) => {
                    warn!(
                        "Warning from {:?}: {} ({:?})",
                        warning.src().map(|s| s.path_string()),
                        warning.error(),
                        warning.debug()
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn pull(&self, timeout: gst::ClockTime) -> Result<Vec<EncodedUnit>> {
        let mut units = Vec::new();
        while let Some(sample) = self.appsink.try_pull_sample(timeout) {
            let buffer = sample
                .buffer()
                .ok_or_else(|| Error::Encoder("sample without buffer".into()))?;
            let map = buffer
                .map_readable()
                .map_err(|_| Error::Encoder("unreadable output buffer".into()))?;
            let sequence = buffer
                .pts()
                .map(|pts| pts.nseconds() / self.frame_duration.nseconds().max(1))
                .unwrap_or_default();

            units.push(EncodedUnit {
                data: Bytes::copy_from_slice(map.as_slice()),
                key: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
                sequence,
            });
        }
        Ok(units)
    }
}

impl Encoder for GstH264Encoder {
    fn name(&self) -> &'static str {
        "gst-h264"
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedUnit>> {
        self.check_bus()?;

        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(self.frame_duration * frame.sequence());
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| Error::Encoder(format!("failed to push buffer: {:?}", e)))?;

        self.pull(gst::ClockTime::ZERO)
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        debug!("Flushing GStreamer encoder");
        self.appsrc
            .end_of_stream()
            .map_err(|e| Error::Encoder(format!("failed to send EOS: {:?}", e)))?;
        let units = self.pull(gst::ClockTime::from_seconds(2))?;
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| Error::Encoder(format!("failed to stop pipeline: {:?}", e)))?;
        Ok(units)
    }
}

impl Drop for GstH264Encoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

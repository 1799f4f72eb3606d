// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! MP4 clip writing.
//!
//! The recorder talks to clip files through [`ClipWriter`] /
//! [`ClipWriterFactory`] so tests can capture frames in memory. The production
//! factory runs a GStreamer pipeline per clip:
//!   appsrc → videoconvert → encoder → mp4mux → filesink
//!
//! The configured frame rate is written into the container; actual frame
//! cadence need not match. A clip keeps the dimensions of its first frame.

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::frame::Frame;

/// An open clip file accepting frames in timestamp order.
pub trait ClipWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the container. Consumes the writer; the file is
    /// complete once this returns.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens clip writers. Shared by every recorder.
pub trait ClipWriterFactory: Send + Sync {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn ClipWriter>>;
}

/// Map a configured codec name to a GStreamer encoder element.
pub fn encoder_element(codec: &str) -> Option<&'static str> {
    match codec {
        "mp4v" | "mpeg4" => Some("avenc_mpeg4"),
        "h264" | "x264" => Some("x264enc"),
        _ => None,
    }
}

/// GStreamer-backed factory used in production.
pub struct Mp4WriterFactory {
    encoder: &'static str,
}

impl Mp4WriterFactory {
    pub fn new(codec: &str) -> Result<Self> {
        let encoder = encoder_element(codec)
            .ok_or_else(|| EngineError::Config(format!("Unknown codec '{codec}'")))?;
        Ok(Mp4WriterFactory { encoder })
    }
}

impl ClipWriterFactory for Mp4WriterFactory {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn ClipWriter>> {
        gst::init().map_err(|e| EngineError::Clip(format!("gst::init: {e}")))?;

        let pipeline_str = format!(
            "appsrc name=src is-live=false format=time block=true ! \
             videoconvert ! {encoder} ! mp4mux ! \
             filesink location=\"{location}\"",
            encoder = self.encoder,
            location = path.display(),
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| EngineError::Clip(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EngineError::Clip("Not a pipeline".into()))?;

        let appsrc: gst_app::AppSrc = pipeline
            .by_name("src")
            .ok_or_else(|| EngineError::Clip("appsrc not found".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| EngineError::Clip("Cast to AppSrc failed".into()))?;

        let video_info =
            gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
                .fps(gst::Fraction::new(fps as i32, 1))
                .build()
                .map_err(|e| EngineError::Clip(format!("video info: {e}")))?;
        appsrc.set_caps(Some(
            &video_info
                .to_caps()
                .map_err(|e| EngineError::Clip(format!("caps: {e}")))?,
        ));

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EngineError::Clip(format!("set_state Playing: {e}")))?;

        debug!(path = %path.display(), width, height, fps, "Clip writer opened");

        Ok(Box::new(Mp4ClipWriter {
            pipeline,
            appsrc,
            width,
            height,
            fps: fps as u64,
            frames_pushed: 0,
        }))
    }
}

struct Mp4ClipWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    width: u32,
    height: u32,
    fps: u64,
    frames_pushed: u64,
}

impl ClipWriter for Mp4ClipWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(EngineError::Clip(format!(
                "frame is {}x{}, clip is {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let mut buffer = gst::Buffer::from_mut_slice(frame.pixels.to_vec());
        {
            let buf = buffer
                .get_mut()
                .ok_or_else(|| EngineError::Clip("buffer not writable".into()))?;
            let frame_ns = 1_000_000_000 / self.fps;
            buf.set_pts(gst::ClockTime::from_nseconds(self.frames_pushed * frame_ns));
            buf.set_duration(gst::ClockTime::from_nseconds(frame_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EngineError::Clip(format!("push_buffer: {e:?}")))?;
        self.frames_pushed += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| EngineError::Clip(format!("end_of_stream: {e:?}")))?;

        // Wait for the muxer to flush the moov atom before tearing down.
        if let Some(bus) = self.pipeline.bus() {
            use gst::MessageView;
            match bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(5),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            ) {
                Some(msg) => {
                    if let MessageView::Error(err) = msg.view() {
                        let _ = self.pipeline.set_state(gst::State::Null);
                        return Err(EngineError::Clip(format!("finalize: {}", err.error())));
                    }
                }
                None => warn!("Timed out waiting for clip EOS"),
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| EngineError::Clip(format!("set_state Null: {e}")))?;
        Ok(())
    }
}

impl Drop for Mp4ClipWriter {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

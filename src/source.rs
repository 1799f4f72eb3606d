// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! RTSP/RTSPS stream capture using GStreamer.
//!
//! Each source runs a GStreamer pipeline:
//!   rtspsrc → decodebin → videoconvert → videoscale → appsink
//!
//! The `appsink` yields raw RGB frames already resized to the configured
//! resolution. Reconnecting is the caller's job: on [`SourceError`] the
//! pipeline owner waits its reconnect interval and calls [`StreamSource::open`]
//! again. A source is never considered permanently dead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::frame::Frame;

/// Recoverable read failures surfaced by [`StreamSource::next_frame`].
#[derive(Debug)]
pub enum SourceError {
    /// The transport stalled or the pipeline went away.
    Disconnected,
    /// The server signalled end of stream.
    Eof,
    /// The decoder reported an error for this read.
    Decode(String),
}

enum SourceEvent {
    Frame(Frame),
    Eos,
    Error(String),
}

/// How long `next_frame` waits for a frame before declaring the source stalled.
const READ_STALL: Duration = Duration::from_secs(15);

/// Replace embedded `user:pass@` credentials with `***:***@` for logging.
pub fn mask_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    match rest.find('@') {
        Some(at) if rest[..at].contains(':') => {
            format!("{}://***:***@{}", &url[..scheme_end], &rest[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// Handle to one capture pipeline.
pub struct StreamSource {
    url: String,
    width: u32,
    height: u32,
    pipeline: Option<gst::Pipeline>,
    rx: Option<mpsc::Receiver<SourceEvent>>,
    bus_stop: Arc<AtomicBool>,
    /// Consecutive decode failures, for the escalation warning.
    decode_failures: u32,
}

impl StreamSource {
    pub fn new(url: &str, width: u32, height: u32) -> Self {
        StreamSource {
            url: url.to_string(),
            width,
            height,
            pipeline: None,
            rx: None,
            bus_stop: Arc::new(AtomicBool::new(false)),
            decode_failures: 0,
        }
    }

    /// The source URL with credentials masked.
    pub fn masked_url(&self) -> String {
        mask_credentials(&self.url)
    }

    /// Build and start the capture pipeline. Does not retry on failure.
    pub fn open(&mut self) -> Result<()> {
        self.close();
        gst::init().map_err(|e| EngineError::Stream(format!("gst::init: {e}")))?;

        let (tx, rx) = mpsc::channel::<SourceEvent>(8);

        let pipeline_str = format!(
            "rtspsrc location={url} latency=200 protocols=tcp ! \
             decodebin ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={w},height={h} ! \
             appsink name=sink emit-signals=true max-buffers=4 drop=true sync=false",
            url = self.url,
            w = self.width,
            h = self.height,
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| EngineError::Stream(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EngineError::Stream("Not a pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| EngineError::Stream("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| EngineError::Stream("Cast to AppSink failed".into()))?;

        let width = self.width;
        let height = self.height;
        let frame_tx = tx.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let frame =
                        Frame::now(width, height, Bytes::copy_from_slice(map.as_slice()));
                    // Non-blocking send; drop the frame if the reader lags.
                    let _ = frame_tx.try_send(SourceEvent::Frame(frame));
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EngineError::Stream(format!("set_state Playing: {e}")))?;

        // Forward bus errors and EOS into the event channel from a plain
        // thread; the capture pipeline has no GLib main loop.
        let bus = pipeline
            .bus()
            .ok_or_else(|| EngineError::Stream("pipeline has no bus".into()))?;
        let stop = Arc::new(AtomicBool::new(false));
        self.bus_stop = stop.clone();
        let bus_tx = tx;
        std::thread::spawn(move || {
            use gst::MessageView;
            while !stop.load(Ordering::Relaxed) {
                let Some(msg) = bus.timed_pop_filtered(
                    gst::ClockTime::from_mseconds(500),
                    &[gst::MessageType::Error, gst::MessageType::Eos],
                ) else {
                    continue;
                };
                match msg.view() {
                    MessageView::Eos(_) => {
                        let _ = bus_tx.blocking_send(SourceEvent::Eos);
                        break;
                    }
                    MessageView::Error(err) => {
                        let _ = bus_tx
                            .blocking_send(SourceEvent::Error(err.error().to_string()));
                        break;
                    }
                    _ => {}
                }
            }
        });

        info!(url = %self.masked_url(), "Capture pipeline started");
        self.pipeline = Some(pipeline);
        self.rx = Some(rx);
        Ok(())
    }

    /// Read the next decoded frame, resized to the configured resolution.
    pub async fn next_frame(&mut self) -> std::result::Result<Frame, SourceError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(SourceError::Disconnected);
        };
        let event = tokio::time::timeout(READ_STALL, rx.recv()).await;
        match event {
            Ok(Some(SourceEvent::Frame(frame))) => {
                self.decode_failures = 0;
                Ok(frame)
            }
            Ok(Some(SourceEvent::Eos)) => Err(SourceError::Eof),
            Ok(Some(SourceEvent::Error(e))) => {
                self.decode_failures += 1;
                if self.decode_failures == 3 {
                    warn!(
                        url = %self.masked_url(),
                        failures = self.decode_failures,
                        "Decoder keeps failing; will continue retrying"
                    );
                }
                Err(SourceError::Decode(e))
            }
            Ok(None) | Err(_) => Err(SourceError::Disconnected),
        }
    }

    /// Tear down the pipeline. Idempotent.
    pub fn close(&mut self) {
        self.bus_stop.store(true, Ordering::Relaxed);
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
            info!(url = %self.masked_url(), "Capture pipeline stopped");
        }
        self.rx = None;
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

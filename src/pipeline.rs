// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-stream pipeline: capture task + detect task.
//!
//! The capture task owns the [`StreamSource`] and drives reconnects. Every
//! frame goes into the pre-roll ring and to the recorder; the freshest frame
//! is offered to the detect task through a 1-slot mailbox that drops when
//! full — the detector is the bottleneck and must never back-pressure
//! capture. The detect task publishes each annotated frame into a `watch`
//! cell for MJPEG delivery.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::detect::{max_confidence, Detector};
use crate::frame::{Frame, FrameRing};
use crate::recorder::EventRecorder;
use crate::source::{mask_credentials, SourceError, StreamSource};

/// Snapshot returned by [`StreamPipeline::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub fps: u32,
    /// Source URL with credentials masked.
    pub source: String,
    pub model: String,
    pub resolution: (u32, u32),
    /// Detections in the most recently processed frame.
    pub detections: usize,
    pub ring_occupancy: usize,
}

/// How long `stop()` waits for the tasks to observe cancellation.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct StreamPipeline {
    stream_id: Uuid,
    name: String,
    masked_url: String,
    resolution: (u32, u32),
    model_name: String,
    running: Arc<AtomicBool>,
    fps: Arc<AtomicU32>,
    detection_count: Arc<AtomicUsize>,
    ring: Arc<FrameRing>,
    recorder: Arc<EventRecorder>,
    annotated_rx: watch::Receiver<Option<Frame>>,
    capture_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    detect_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StreamPipeline {
    /// Spawn the capture and detect tasks for one stream.
    pub fn start(
        stream_id: Uuid,
        config: &StreamConfig,
        resolution: (u32, u32),
        ring: Arc<FrameRing>,
        recorder: Arc<EventRecorder>,
        detector: Arc<dyn Detector>,
    ) -> Arc<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let fps = Arc::new(AtomicU32::new(0));
        let detection_count = Arc::new(AtomicUsize::new(0));
        let (mailbox_tx, mailbox_rx) = mpsc::channel::<Frame>(1);
        let (annotated_tx, annotated_rx) = watch::channel::<Option<Frame>>(None);

        let capture_handle = tokio::spawn(capture_loop(
            config.clone(),
            resolution,
            running.clone(),
            fps.clone(),
            ring.clone(),
            recorder.clone(),
            mailbox_tx,
        ));

        let detect_handle = tokio::spawn(detect_loop(
            config.name.clone(),
            running.clone(),
            fps.clone(),
            detection_count.clone(),
            detector.clone(),
            recorder.clone(),
            mailbox_rx,
            annotated_tx,
        ));

        info!(stream = %config.name, url = %mask_credentials(&config.url), "Pipeline started");

        Arc::new(StreamPipeline {
            stream_id,
            name: config.name.clone(),
            masked_url: mask_credentials(&config.url),
            resolution,
            model_name: detector.model_name().to_string(),
            running,
            fps,
            detection_count,
            ring,
            recorder,
            annotated_rx,
            capture_handle: parking_lot::Mutex::new(Some(capture_handle)),
            detect_handle: parking_lot::Mutex::new(Some(detect_handle)),
        })
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    /// Latest annotated frame, for the MJPEG handler.
    pub fn annotated_frames(&self) -> watch::Receiver<Option<Frame>> {
        self.annotated_rx.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            running: self.running.load(Ordering::Relaxed),
            fps: self.fps.load(Ordering::Relaxed),
            source: self.masked_url.clone(),
            model: self.model_name.clone(),
            resolution: self.resolution,
            detections: self.detection_count.load(Ordering::Relaxed),
            ring_occupancy: self.ring.occupancy(),
        }
    }

    /// Flip the cancellation flag, wait for both tasks (bounded), finalize
    /// any live recording, and drain the ring.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);

        for slot in [&self.capture_handle, &self.detect_handle] {
            let handle = slot.lock().take();
            if let Some(mut handle) = handle {
                if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                    warn!(stream = %self.name, "Task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.recorder.stop();
        self.ring.clear();
        info!(stream = %self.name, "Pipeline stopped");
    }
}

/// Poll the cancellation flag; resolves once it flips.
async fn cancelled(running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Sleep that wakes early on cancellation.
async fn sleep_cancellable(running: &AtomicBool, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancelled(running) => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn capture_loop(
    config: StreamConfig,
    resolution: (u32, u32),
    running: Arc<AtomicBool>,
    fps: Arc<AtomicU32>,
    ring: Arc<FrameRing>,
    recorder: Arc<EventRecorder>,
    mailbox_tx: mpsc::Sender<Frame>,
) {
    let reconnect = Duration::from_secs(config.reconnect_interval_secs);
    let mut source = StreamSource::new(&config.url, resolution.0, resolution.1);

    // Initial connect, retried until it works or the pipeline stops.
    while running.load(Ordering::Relaxed) {
        match source.open() {
            Ok(()) => break,
            Err(e) => {
                warn!(
                    stream = %config.name,
                    url = %source.masked_url(),
                    error = %e,
                    "Connect failed, retrying"
                );
                sleep_cancellable(&running, reconnect).await;
            }
        }
    }

    let mut frames_this_second = 0u32;
    let mut fps_window = tokio::time::Instant::now();

    while running.load(Ordering::Relaxed) {
        let result = tokio::select! {
            r = source.next_frame() => r,
            _ = cancelled(&running) => break,
        };

        match result {
            Ok(frame) => {
                frames_this_second += 1;
                let now = tokio::time::Instant::now();
                if now.duration_since(fps_window) >= Duration::from_secs(1) {
                    fps.store(frames_this_second, Ordering::Relaxed);
                    frames_this_second = 0;
                    fps_window = now;
                }

                ring.push(frame.clone());
                recorder.on_frame(&frame);
                // 1-slot mailbox, drop when the detect task lags.
                let _ = mailbox_tx.try_send(frame);
            }
            Err(e) => {
                match &e {
                    SourceError::Eof => {
                        info!(stream = %config.name, "Stream ended, reconnecting")
                    }
                    SourceError::Disconnected => {
                        warn!(stream = %config.name, "Stream disconnected, reconnecting")
                    }
                    SourceError::Decode(msg) => {
                        warn!(stream = %config.name, error = %msg, "Decode error, reconnecting")
                    }
                }
                fps.store(0, Ordering::Relaxed);
                sleep_cancellable(&running, reconnect).await;
                if let Err(e) = source.open() {
                    warn!(stream = %config.name, error = %e, "Reconnect failed");
                }
            }
        }
    }

    source.close();
}

#[allow(clippy::too_many_arguments)]
async fn detect_loop(
    stream_name: String,
    running: Arc<AtomicBool>,
    fps: Arc<AtomicU32>,
    detection_count: Arc<AtomicUsize>,
    detector: Arc<dyn Detector>,
    recorder: Arc<EventRecorder>,
    mut mailbox_rx: mpsc::Receiver<Frame>,
    annotated_tx: watch::Sender<Option<Frame>>,
) {
    while running.load(Ordering::Relaxed) {
        let frame = match tokio::time::timeout(Duration::from_secs(1), mailbox_rx.recv()).await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => continue,
        };

        // Inference is CPU-bound; keep it off the async workers.
        let det = detector.clone();
        let fps_now = fps.load(Ordering::Relaxed);
        let result =
            tokio::task::spawn_blocking(move || det.infer(&frame, fps_now)).await;
        let (annotated, detections) = match result {
            Ok(out) => out,
            Err(e) => {
                warn!(stream = %stream_name, error = %e, "Inference task failed");
                continue;
            }
        };

        detection_count.store(detections.len(), Ordering::Relaxed);
        let max_conf = max_confidence(&detections);
        recorder.on_detection(&detections, &annotated, annotated.mono_ns, max_conf);
        annotated_tx.send_replace(Some(annotated));
    }
}

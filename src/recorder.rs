// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Event recorder — the pre/post-roll state machine.
//!
//! One recorder per stream. Every captured frame flows through
//! [`EventRecorder::on_frame`]; qualifying detections arrive through
//! [`EventRecorder::on_detection`]. A detection starts a clip seeded with the
//! ring's pre-roll, further detections extend it by resetting the cooldown,
//! and `post_buffer_seconds` of detection silence finalizes it into the
//! catalogue.
//!
//! Invariants: at most one live recording per stream (everything runs under
//! the per-stream state mutex), and a finalized clip always contains the ring
//! snapshot taken at start, in FIFO order, before any live frame.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalogue::{Catalogue, NewRecording};
use crate::clip::{ClipWriter, ClipWriterFactory};
use crate::detect::Detection;
use crate::frame::{mono_now_ns, wall_now_ms, Frame, FrameRing};

/// Recorder tuning, shared by all streams.
#[derive(Debug, Clone)]
pub struct RecorderParams {
    pub pre_buffer_seconds: u32,
    pub post_buffer_seconds: u32,
    pub min_confidence: f32,
    pub fps: u32,
    /// Minimum seconds between the starts of two recordings.
    pub min_gap_secs: u32,
    /// Classes allowed to trigger a recording (empty = all qualify).
    pub record_objects: Vec<String>,
    pub recordings_dir: PathBuf,
}

/// A clip currently being written.
struct RecordingJob {
    recording_id: String,
    start_wall_ms: i64,
    start_mono_ns: i64,
    last_detection_ns: i64,
    frame_count: u64,
    writer: Option<Box<dyn ClipWriter>>,
    file_path: PathBuf,
    thumbnail_path: Option<PathBuf>,
    /// Qualifying detections seen over the clip, one entry per class with the
    /// best confidence.
    objects: Vec<Detection>,
    max_confidence: f32,
    write_error: bool,
}

struct RecorderState {
    recording: Option<RecordingJob>,
    last_detection_ns: i64,
    last_recording_start_ns: Option<i64>,
    cooldown: Option<JoinHandle<()>>,
}

pub struct EventRecorder {
    stream_id: Uuid,
    stream_name: String,
    params: RecorderParams,
    ring: Arc<FrameRing>,
    catalogue: Arc<Catalogue>,
    factory: Arc<dyn ClipWriterFactory>,
    state: Mutex<RecorderState>,
}

impl EventRecorder {
    pub fn new(
        stream_id: Uuid,
        stream_name: &str,
        params: RecorderParams,
        ring: Arc<FrameRing>,
        catalogue: Arc<Catalogue>,
        factory: Arc<dyn ClipWriterFactory>,
    ) -> Self {
        EventRecorder {
            stream_id,
            stream_name: stream_name.to_string(),
            params,
            ring,
            catalogue,
            factory,
            state: Mutex::new(RecorderState {
                recording: None,
                last_detection_ns: 0,
                last_recording_start_ns: None,
                cooldown: None,
            }),
        }
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Paths of the clip currently being written, if any. The janitor must
    /// not touch these.
    pub fn live_paths(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        let mut paths = Vec::new();
        if let Some(job) = &state.recording {
            paths.push(job.file_path.clone());
            if let Some(t) = &job.thumbnail_path {
                paths.push(t.clone());
            }
        }
        paths
    }

    /// Called by the capture task for every frame, detected or not. When a
    /// recording is live the frame goes straight into the clip.
    pub fn on_frame(&self, frame: &Frame) {
        let mut state = self.state.lock();
        let failed = {
            let Some(job) = state.recording.as_mut() else {
                return;
            };
            let Some(writer) = job.writer.as_mut() else {
                return;
            };
            match writer.write_frame(frame) {
                Ok(()) => {
                    job.frame_count += 1;
                    None
                }
                Err(e) => {
                    job.write_error = true;
                    Some((job.recording_id.clone(), e))
                }
            }
        };
        if let Some((recording_id, e)) = failed {
            // Disk trouble mid-clip: keep what we have, flag the row.
            error!(
                stream = %self.stream_name,
                recording = %recording_id,
                error = %e,
                "Write error during recording, finalizing early"
            );
            self.finalize_locked(&mut state);
        }
    }

    /// Called by the detect task with the filtered detections for one frame.
    pub fn on_detection(
        self: &Arc<Self>,
        detections: &[Detection],
        annotated: &Frame,
        ts_ns: i64,
        max_confidence: f32,
    ) {
        if max_confidence < self.params.min_confidence {
            return;
        }
        let qualifying: Vec<&Detection> = if self.params.record_objects.is_empty() {
            detections.iter().collect()
        } else {
            // An allow-list is configured: the event is ignored unless some
            // detection matches it.
            let matched: Vec<&Detection> = detections
                .iter()
                .filter(|d| self.params.record_objects.iter().any(|c| c == &d.class_name))
                .collect();
            if matched.is_empty() {
                return;
            }
            matched
        };

        let mut state = self.state.lock();
        state.last_detection_ns = ts_ns;

        // Extend the live clip, if any: refresh the detection time, fold in
        // the classes, and push the cooldown out.
        let extended = state.recording.as_mut().map(|job| {
            job.last_detection_ns = ts_ns;
            job.max_confidence = job.max_confidence.max(max_confidence);
            for det in qualifying.iter().copied() {
                merge_detection(&mut job.objects, det);
            }
            job.recording_id.clone()
        });
        if let Some(recording_id) = extended {
            let deadline = ts_ns + self.post_buffer_ns();
            self.schedule_cooldown(&mut state, recording_id, deadline);
            return;
        }

        // Rate limit between clip starts.
        if let Some(last_start) = state.last_recording_start_ns {
            let gap_ns = self.params.min_gap_secs as i64 * 1_000_000_000;
            if ts_ns - last_start < gap_ns {
                return;
            }
        }

        let recording_id = format!("{}_{}", self.stream_id, annotated.wall_ms);
        let stem = self.file_stem(annotated.wall_ms);
        let file_path = self.params.recordings_dir.join(format!("{stem}.mp4"));
        let thumbnail_path = self.params.recordings_dir.join(format!("{stem}_thumb.jpg"));

        let thumbnail_path = match save_thumbnail(annotated, &thumbnail_path) {
            Ok(()) => Some(thumbnail_path),
            Err(e) => {
                warn!(stream = %self.stream_name, error = %e, "Failed to save thumbnail");
                None
            }
        };

        let mut writer = match self.factory.open(
            &file_path,
            annotated.width,
            annotated.height,
            self.params.fps,
        ) {
            Ok(w) => w,
            Err(e) => {
                // No partial file: abandon this event and wait for the next.
                error!(
                    stream = %self.stream_name,
                    path = %file_path.display(),
                    error = %e,
                    "Failed to open clip writer, skipping event"
                );
                return;
            }
        };

        // Pre-roll from the ring, oldest first, then the triggering frame.
        // Frames captured after the trigger are dropped from the snapshot so
        // clip timestamps stay non-decreasing.
        let mut frame_count = 0u64;
        let mut write_error = false;
        let pre_roll: Vec<Frame> = self
            .ring
            .snapshot()
            .into_iter()
            .filter(|f| f.mono_ns <= ts_ns)
            .collect();
        for frame in pre_roll.iter().chain(std::iter::once(annotated)) {
            match writer.write_frame(frame) {
                Ok(()) => frame_count += 1,
                Err(e) => {
                    error!(
                        stream = %self.stream_name,
                        error = %e,
                        "Write error during pre-roll"
                    );
                    write_error = true;
                    break;
                }
            }
        }

        let mut objects = Vec::new();
        for det in qualifying.iter().copied() {
            merge_detection(&mut objects, det);
        }

        info!(
            stream = %self.stream_name,
            recording = %recording_id,
            pre_roll = pre_roll.len(),
            classes = ?objects.iter().map(|d| d.class_name.as_str()).collect::<Vec<_>>(),
            "Recording started"
        );

        state.recording = Some(RecordingJob {
            recording_id: recording_id.clone(),
            start_wall_ms: annotated.wall_ms,
            start_mono_ns: ts_ns,
            last_detection_ns: ts_ns,
            frame_count,
            writer: Some(writer),
            file_path,
            thumbnail_path,
            objects,
            max_confidence,
            write_error,
        });
        state.last_recording_start_ns = Some(ts_ns);

        if write_error {
            self.finalize_locked(&mut state);
        } else {
            let deadline = ts_ns + self.post_buffer_ns();
            self.schedule_cooldown(&mut state, recording_id, deadline);
        }
    }

    /// Finalize any live recording and cancel the cooldown. Called on
    /// pipeline stop and supervisor shutdown.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.cooldown.take() {
            handle.abort();
        }
        if state.recording.is_some() {
            self.finalize_locked(&mut state);
        }
    }

    fn post_buffer_ns(&self) -> i64 {
        self.params.post_buffer_seconds as i64 * 1_000_000_000
    }

    /// Replace the cooldown task with one firing at `deadline_ns` for
    /// `recording_id`. Stale firings no-op on id mismatch; early firings
    /// reschedule themselves to `last_detection + post_buffer`.
    fn schedule_cooldown(
        self: &Arc<Self>,
        state: &mut RecorderState,
        recording_id: String,
        deadline_ns: i64,
    ) {
        if let Some(handle) = state.cooldown.take() {
            handle.abort();
        }
        let recorder = Arc::clone(self);
        state.cooldown = Some(tokio::spawn(async move {
            let mut deadline = deadline_ns;
            loop {
                let wait = (deadline - mono_now_ns()).max(0) as u64;
                tokio::time::sleep(Duration::from_nanos(wait)).await;
                match recorder.cooldown_fired(&recording_id) {
                    Some(next) => deadline = next,
                    None => break,
                }
            }
        }));
    }

    /// Cooldown check. Returns the next deadline when the clip was extended
    /// since the timer was armed, `None` when done (finalized or stale).
    fn cooldown_fired(&self, recording_id: &str) -> Option<i64> {
        let mut state = self.state.lock();
        let job = state.recording.as_ref()?;
        if job.recording_id != recording_id {
            // A newer recording replaced the one this timer was armed for.
            return None;
        }
        let idle = mono_now_ns() - job.last_detection_ns;
        if idle < self.post_buffer_ns() {
            return Some(job.last_detection_ns + self.post_buffer_ns());
        }
        self.finalize_locked(&mut state);
        None
    }

    /// Close the writer and commit the catalogue row. Caller holds the state
    /// lock.
    fn finalize_locked(&self, state: &mut RecorderState) {
        let Some(mut job) = state.recording.take() else {
            return;
        };
        if let Some(handle) = state.cooldown.take() {
            handle.abort();
        }

        let mut write_error = job.write_error;
        if let Some(writer) = job.writer.take() {
            if let Err(e) = writer.finish() {
                error!(
                    stream = %self.stream_name,
                    recording = %job.recording_id,
                    error = %e,
                    "Failed to finalize clip file"
                );
                write_error = true;
            }
        }

        let duration = (wall_now_ms() - job.start_wall_ms) as f64 / 1000.0;

        let mut objects = match serde_json::to_value(&job.objects) {
            Ok(serde_json::Value::Array(arr)) => arr,
            _ => Vec::new(),
        };
        if write_error {
            objects.push(serde_json::json!({ "write_error": true }));
        }

        let row = NewRecording {
            timestamp: iso_local(job.start_wall_ms),
            stream_id: self.stream_id.to_string(),
            stream_name: self.stream_name.clone(),
            file_path: job.file_path.display().to_string(),
            duration,
            objects_detected: serde_json::Value::Array(objects),
            thumbnail_path: job.thumbnail_path.as_ref().map(|p| p.display().to_string()),
            confidence: job.max_confidence as f64,
        };

        match self.catalogue.insert(&row) {
            Ok(id) => {
                info!(
                    stream = %self.stream_name,
                    recording = %job.recording_id,
                    row_id = id,
                    duration = format!("{duration:.2}"),
                    frames = job.frame_count,
                    "Recording finalized"
                );
            }
            Err(e) => {
                // The file stays on disk; retry once, and the janitor sweeps
                // it as an orphan if the row never lands.
                error!(
                    stream = %self.stream_name,
                    recording = %job.recording_id,
                    error = %e,
                    "Catalogue insert failed, scheduling retry"
                );
                let catalogue = Arc::clone(&self.catalogue);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if let Err(e) = catalogue.insert(&row) {
                        error!(error = %e, "Catalogue insert retry failed");
                    }
                });
            }
        }
    }

    /// `<stream_name>_<YYYY-MM-DD_HH-MM-SS>`, filesystem-safe.
    fn file_stem(&self, wall_ms: i64) -> String {
        let name: String = self
            .stream_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
            .collect();
        let ts = chrono::Local
            .timestamp_millis_opt(wall_ms)
            .single()
            .unwrap_or_else(chrono::Local::now);
        format!("{}_{}", name, ts.format("%Y-%m-%d_%H-%M-%S"))
    }
}

/// Keep one entry per class, upgrading confidence and bbox on a better hit.
fn merge_detection(objects: &mut Vec<Detection>, det: &Detection) {
    match objects.iter_mut().find(|o| o.class_name == det.class_name) {
        Some(existing) => {
            if det.confidence > existing.confidence {
                existing.confidence = det.confidence;
                existing.bbox = det.bbox;
            }
        }
        None => objects.push(det.clone()),
    }
}

fn save_thumbnail(frame: &Frame, path: &std::path::Path) -> crate::error::Result<()> {
    use crate::error::EngineError;
    let img = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())
        .ok_or_else(|| EngineError::Clip("frame buffer size mismatch".into()))?;
    img.save(path)
        .map_err(|e| EngineError::Clip(format!("thumbnail: {e}")))
}

/// ISO-8601 local wall time with millisecond precision, the catalogue's
/// `timestamp` format.
fn iso_local(wall_ms: i64) -> String {
    chrono::Local
        .timestamp_millis_opt(wall_ms)
        .single()
        .unwrap_or_else(chrono::Local::now)
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

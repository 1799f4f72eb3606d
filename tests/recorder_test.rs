// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Event recorder scenarios: trigger/finalize, cooldown extension, rate
//! limiting, class allow-list, writer failure handling.
//!
//! Clips are captured by an in-memory writer so the tests observe exactly
//! which frames the recorder wrote, in order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

use sentinel::catalogue::{Catalogue, Page, RecordingFilter, SortKey, SortOrder};
use sentinel::clip::{ClipWriter, ClipWriterFactory};
use sentinel::detect::Detection;
use sentinel::error::{EngineError, Result};
use sentinel::frame::{Frame, FrameRing};
use sentinel::recorder::{EventRecorder, RecorderParams};

// ──────────────── in-memory clip writer ───────────────────────────────────

#[derive(Default)]
struct ClipRecord {
    path: PathBuf,
    /// `mono_ns` of every frame written, in write order.
    frames: Vec<i64>,
    finished: bool,
}

#[derive(Default)]
struct MemFactory {
    clips: Arc<Mutex<Vec<ClipRecord>>>,
    fail_open: AtomicBool,
    /// Fail every write after this many successful ones.
    fail_writes_after: Mutex<Option<usize>>,
}

impl MemFactory {
    fn clip_count(&self) -> usize {
        self.clips.lock().len()
    }

    fn clip_frames(&self, idx: usize) -> Vec<i64> {
        self.clips.lock()[idx].frames.clone()
    }

    fn clip_finished(&self, idx: usize) -> bool {
        self.clips.lock()[idx].finished
    }
}

struct MemWriter {
    clips: Arc<Mutex<Vec<ClipRecord>>>,
    idx: usize,
    fail_after: Option<usize>,
    written: usize,
}

impl ClipWriterFactory for MemFactory {
    fn open(&self, path: &Path, _w: u32, _h: u32, _fps: u32) -> Result<Box<dyn ClipWriter>> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(EngineError::Clip("injected open failure".into()));
        }
        let mut clips = self.clips.lock();
        clips.push(ClipRecord { path: path.to_path_buf(), ..Default::default() });
        Ok(Box::new(MemWriter {
            clips: self.clips.clone(),
            idx: clips.len() - 1,
            fail_after: *self.fail_writes_after.lock(),
            written: 0,
        }))
    }
}

impl ClipWriter for MemWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.written >= limit {
                return Err(EngineError::Clip("injected write failure".into()));
            }
        }
        self.written += 1;
        self.clips.lock()[self.idx].frames.push(frame.mono_ns);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.clips.lock()[self.idx].finished = true;
        Ok(())
    }
}

// ──────────────── helpers ─────────────────────────────────────────────────

struct Rig {
    _dir: TempDir,
    catalogue: Arc<Catalogue>,
    ring: Arc<FrameRing>,
    factory: Arc<MemFactory>,
    recorder: Arc<EventRecorder>,
}

fn rig(params_tune: impl FnOnce(&mut RecorderParams)) -> Rig {
    let dir = tempfile::tempdir().expect("create tempdir");
    let catalogue =
        Arc::new(Catalogue::open(&dir.path().join("recordings.db")).expect("open catalogue"));
    let mut params = RecorderParams {
        pre_buffer_seconds: 2,
        post_buffer_seconds: 1,
        min_confidence: 0.5,
        fps: 10,
        min_gap_secs: 0,
        record_objects: Vec::new(),
        recordings_dir: dir.path().to_path_buf(),
    };
    params_tune(&mut params);

    let ring = Arc::new(FrameRing::new(params.pre_buffer_seconds, params.fps));
    let factory = Arc::new(MemFactory::default());
    let recorder = Arc::new(EventRecorder::new(
        Uuid::new_v4(),
        "front-door",
        params,
        ring.clone(),
        catalogue.clone(),
        factory.clone(),
    ));
    Rig { _dir: dir, catalogue, ring, factory, recorder }
}

fn frame() -> Frame {
    Frame::now(4, 4, Bytes::from(vec![0u8; 48]))
}

fn det(class: &str, confidence: f32) -> Detection {
    Detection {
        class_name: class.to_string(),
        confidence,
        bbox: [10.0, 10.0, 50.0, 80.0],
    }
}

fn rows(catalogue: &Catalogue) -> Vec<sentinel::catalogue::CatalogueRow> {
    catalogue
        .list(&RecordingFilter::default(), SortKey::Timestamp, SortOrder::Asc, Page::default())
        .expect("list")
}

// ──────────────── scenarios ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_and_finalize() {
    let rig = rig(|_| {});

    // 3 seconds of idle footage fills the ring (capacity 20).
    for _ in 0..30 {
        rig.ring.push(frame());
    }
    let pre_roll: Vec<i64> = rig.ring.snapshot().iter().map(|f| f.mono_ns).collect();
    assert_eq!(pre_roll.len(), 20);

    let trigger = frame();
    let dets = vec![det("person", 0.8)];
    rig.recorder.on_detection(&dets, &trigger, trigger.mono_ns, 0.8);

    // Live frames keep flowing while the clip is open.
    for _ in 0..10 {
        rig.recorder.on_frame(&frame());
    }

    tokio::time::sleep(Duration::from_millis(1800)).await;

    let rows = rows(&rig.catalogue);
    assert_eq!(rows.len(), 1, "exactly one catalogue row");
    let row = &rows[0];
    assert_eq!(row.confidence, 0.8f32 as f64);
    assert!(row.duration > 0.0);
    assert_eq!(row.stream_name, "front-door");
    let classes: Vec<&str> = row
        .objects_detected
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|o| o["class"].as_str())
        .collect();
    assert_eq!(classes, vec!["person"]);
    assert!(row.thumbnail_path.is_some());

    // Ring pre-roll correspondence: the clip starts with the exact ring
    // snapshot in FIFO order, then the triggering frame, then live frames.
    assert_eq!(rig.factory.clip_count(), 1);
    let written = rig.factory.clip_frames(0);
    assert_eq!(written.len(), 20 + 1 + 10);
    assert_eq!(&written[..20], &pre_roll[..]);
    assert_eq!(written[20], trigger.mono_ns);
    assert!(written.windows(2).all(|w| w[0] <= w[1]), "timestamps non-decreasing");
    assert!(rig.factory.clip_finished(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cooldown_extension_yields_single_clip() {
    let rig = rig(|_| {});

    for _ in 0..5 {
        rig.ring.push(frame());
    }
    let first = frame();
    rig.recorder.on_detection(&[det("person", 0.7)], &first, first.mono_ns, 0.7);

    // A second detection 600 ms in extends the cooldown past its original
    // 1 s deadline.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let second = frame();
    rig.recorder.on_detection(&[det("person", 0.6)], &second, second.mono_ns, 0.6);

    // Past the original deadline the clip must still be open.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(rows(&rig.catalogue).len(), 0, "clip still live at t=1.2s");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let rows = rows(&rig.catalogue);
    assert_eq!(rows.len(), 1, "one extended clip, not two");
    assert_eq!(rig.factory.clip_count(), 1);
    // Confidence is the max over the clip, not the last detection.
    assert_eq!(rows[0].confidence, 0.7f32 as f64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_between_recordings() {
    let rig = rig(|p| p.min_gap_secs = 3);

    let first = frame();
    rig.recorder.on_detection(&[det("person", 0.9)], &first, first.mono_ns, 0.9);

    // Finalized after ~1 s of silence; a detection at ~1.4 s is inside the
    // 3 s start-to-start gap and must be ignored.
    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert_eq!(rows(&rig.catalogue).len(), 1);
    let early = frame();
    rig.recorder.on_detection(&[det("person", 0.9)], &early, early.mono_ns, 0.9);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.factory.clip_count(), 1, "rate-limited detection ignored");

    // Past the gap a new recording starts.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    let late = frame();
    rig.recorder.on_detection(&[det("person", 0.9)], &late, late.mono_ns, 0.9);
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(rows(&rig.catalogue).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_record_objects_allow_list() {
    let rig = rig(|p| p.record_objects = vec!["person".into()]);

    // A confident car alone does not qualify.
    let car = frame();
    rig.recorder.on_detection(&[det("car", 0.9)], &car, car.mono_ns, 0.9);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.factory.clip_count(), 0);

    // A person does, even at lower confidence.
    let person = frame();
    rig.recorder.on_detection(&[det("person", 0.6)], &person, person.mono_ns, 0.6);
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let rows = rows(&rig.catalogue);
    assert_eq!(rows.len(), 1);
    let classes: Vec<&str> = rows[0]
        .objects_detected
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|o| o["class"].as_str())
        .collect();
    assert_eq!(classes, vec!["person"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_low_confidence_ignored() {
    let rig = rig(|_| {});

    let f = frame();
    rig.recorder.on_detection(&[det("person", 0.4)], &f, f.mono_ns, 0.4);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.factory.clip_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_live_recording_per_stream() {
    let rig = rig(|_| {});

    let first = frame();
    rig.recorder.on_detection(&[det("person", 0.8)], &first, first.mono_ns, 0.8);
    // Detections while live extend the same job; no second writer opens.
    for _ in 0..5 {
        let f = frame();
        rig.recorder.on_detection(&[det("person", 0.8)], &f, f.mono_ns, 0.8);
    }
    assert_eq!(rig.factory.clip_count(), 1);

    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert_eq!(rows(&rig.catalogue).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writer_open_failure_abandons_event() {
    let rig = rig(|_| {});
    rig.factory.fail_open.store(true, Ordering::Relaxed);

    let f = frame();
    rig.recorder.on_detection(&[det("person", 0.8)], &f, f.mono_ns, 0.8);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // No partial clip, no catalogue row.
    assert_eq!(rig.factory.clip_count(), 0);
    assert_eq!(rows(&rig.catalogue).len(), 0);

    // The failure does not poison the stream: the next event records.
    rig.factory.fail_open.store(false, Ordering::Relaxed);
    let f = frame();
    rig.recorder.on_detection(&[det("person", 0.8)], &f, f.mono_ns, 0.8);
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(rows(&rig.catalogue).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_error_finalizes_with_flag() {
    let rig = rig(|_| {});
    // Pre-roll is empty; allow the trigger frame then fail the next write.
    *rig.factory.fail_writes_after.lock() = Some(1);

    let f = frame();
    rig.recorder.on_detection(&[det("person", 0.8)], &f, f.mono_ns, 0.8);
    rig.recorder.on_frame(&frame());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Finalized immediately with the partial clip flagged in the row.
    let rows = rows(&rig.catalogue);
    assert_eq!(rows.len(), 1);
    let flagged = rows[0]
        .objects_detected
        .as_array()
        .expect("array")
        .iter()
        .any(|o| o.get("write_error").and_then(|v| v.as_bool()) == Some(true));
    assert!(flagged, "row carries the write_error marker");
    assert!(rig.factory.clip_finished(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_finalizes_live_recording() {
    let rig = rig(|_| {});

    let f = frame();
    rig.recorder.on_detection(&[det("person", 0.8)], &f, f.mono_ns, 0.8);
    assert_eq!(rows(&rig.catalogue).len(), 0);

    rig.recorder.stop();

    assert_eq!(rows(&rig.catalogue).len(), 1);
    assert!(rig.factory.clip_finished(0));
    assert!(rig.recorder.live_paths().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_paths_while_recording() {
    let rig = rig(|_| {});

    let f = frame();
    rig.recorder.on_detection(&[det("person", 0.8)], &f, f.mono_ns, 0.8);

    let live = rig.recorder.live_paths();
    assert!(!live.is_empty());
    assert!(live[0].extension().and_then(|e| e.to_str()) == Some("mp4"));

    rig.recorder.stop();
}

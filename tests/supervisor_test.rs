// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Supervisor lifecycle tests with injected detector and clip writer.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use sentinel::catalogue::Catalogue;
use sentinel::clip::{ClipWriter, ClipWriterFactory};
use sentinel::config::{ApiConfig, Config, DetectionConfig, RecordingConfig, StorageConfig, StreamConfig};
use sentinel::detect::{Detection, Detector};
use sentinel::error::Result;
use sentinel::frame::Frame;
use sentinel::supervisor::Supervisor;

struct NullDetector {
    classes: Vec<String>,
}

impl Detector for NullDetector {
    fn infer(&self, frame: &Frame, _fps: u32) -> (Frame, Vec<Detection>) {
        (frame.clone(), Vec::new())
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn model_name(&self) -> &str {
        "null"
    }
}

struct NullWriter;

impl ClipWriter for NullWriter {
    fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct NullFactory;

impl ClipWriterFactory for NullFactory {
    fn open(&self, _path: &Path, _w: u32, _h: u32, _fps: u32) -> Result<Box<dyn ClipWriter>> {
        Ok(Box::new(NullWriter))
    }
}

fn test_config(dir: &TempDir) -> Config {
    Config {
        storage: StorageConfig {
            recordings_dir: dir.path().to_path_buf(),
            max_storage_gb: 1.0,
            janitor_interval_secs: 3600,
        },
        detection: DetectionConfig::default(),
        recording: RecordingConfig::default(),
        streams: Vec::new(),
        api: ApiConfig::default(),
    }
}

fn build_supervisor(dir: &TempDir) -> Arc<Supervisor> {
    let catalogue =
        Arc::new(Catalogue::open(&dir.path().join("recordings.db")).expect("open catalogue"));
    Supervisor::with_components(
        test_config(dir),
        catalogue,
        Arc::new(NullDetector { classes: vec!["person".into()] }),
        Arc::new(NullFactory),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_register_and_unregister_stream() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let supervisor = build_supervisor(&dir);
    assert!(supervisor.stream_statuses().is_empty());

    // An unreachable URL is fine: the pipeline keeps retrying until stopped.
    let stream_id = supervisor.register_stream(&StreamConfig {
        name: "front-door".into(),
        url: "rtsp://127.0.0.1:1/video/front-door".into(),
        reconnect_interval_secs: 1,
    });

    let statuses = supervisor.stream_statuses();
    assert_eq!(statuses.len(), 1);
    let (id, name, status) = &statuses[0];
    assert_eq!(*id, stream_id);
    assert_eq!(name, "front-door");
    assert!(status.running);
    assert_eq!(status.resolution, (960, 540));
    assert!(!status.source.contains("pass"), "credentials never appear in status");

    assert!(supervisor.annotated_frames(stream_id).is_some());
    assert!(supervisor.annotated_frames(Uuid::new_v4()).is_none());
    assert!(supervisor.live_recorder_paths().is_empty());

    supervisor.unregister_stream(stream_id).await.expect("unregister");
    assert!(supervisor.stream_statuses().is_empty());

    // Unknown ids are an error, not a panic.
    assert!(supervisor.unregister_stream(stream_id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_is_idempotent() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let supervisor = build_supervisor(&dir);

    supervisor.register_stream(&StreamConfig {
        name: "cam".into(),
        url: "rtsp://127.0.0.1:1/video/cam".into(),
        reconnect_interval_secs: 1,
    });

    supervisor.shutdown().await;
    assert!(supervisor.stream_statuses().is_empty());
    // A second shutdown is a no-op.
    supervisor.shutdown().await;
}

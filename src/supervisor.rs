// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Supervisor: owns every stream pipeline, the shared catalogue, the shared
//! detector and the storage janitor.
//!
//! Streams can be registered and unregistered at runtime. Shutdown is
//! idempotent, finalizes every in-flight recording, and is backed by a
//! supervisor-owned hard-exit watchdog so a stuck decoder cannot hold the
//! process hostage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalogue::Catalogue;
use crate::clip::{ClipWriterFactory, Mp4WriterFactory};
use crate::config::{Config, StreamConfig};
use crate::detect::yolo::YoloDetector;
use crate::detect::{DetectionFilter, Detector};
use crate::error::{EngineError, Result};
use crate::frame::{Frame, FrameRing};
use crate::janitor::StorageJanitor;
use crate::pipeline::{PipelineStatus, StreamPipeline};
use crate::recorder::{EventRecorder, RecorderParams};

/// Grace period between shutdown start and the forced process exit.
const WATCHDOG_GRACE: Duration = Duration::from_secs(3);

struct StreamRegistration {
    name: String,
    pipeline: Arc<StreamPipeline>,
}

pub struct Supervisor {
    config: Config,
    catalogue: Arc<Catalogue>,
    detector: Arc<dyn Detector>,
    factory: Arc<dyn ClipWriterFactory>,
    streams: Mutex<HashMap<Uuid, StreamRegistration>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    /// Open the catalogue, load the detector, start the janitor, and register
    /// every configured stream. Any failure here is fatal.
    pub fn start(config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.storage.recordings_dir).map_err(|e| {
            EngineError::Config(format!(
                "Cannot create recordings dir {}: {e}",
                config.storage.recordings_dir.display()
            ))
        })?;

        let db_path = config.storage.recordings_dir.join("recordings.db");
        let catalogue = Arc::new(Catalogue::open(&db_path)?);

        let filter = DetectionFilter {
            confidence_threshold: config.detection.confidence,
            filter_classes: config.detection.filter_classes.clone(),
            min_area: config.detection.min_area,
            max_area: config.detection.max_area,
        };
        let detector: Arc<dyn Detector> = Arc::new(YoloDetector::load(
            &config.detection.model_path,
            filter,
            &config.detection.label_font,
        )?);

        let factory: Arc<dyn ClipWriterFactory> =
            Arc::new(Mp4WriterFactory::new(&config.recording.codec)?);

        let supervisor = Arc::new(Supervisor {
            config,
            catalogue,
            detector,
            factory,
            streams: Mutex::new(HashMap::new()),
            janitor: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });

        supervisor.spawn_janitor();

        for stream_cfg in supervisor.config.streams.clone() {
            let id = supervisor.register_stream(&stream_cfg);
            info!(stream = %stream_cfg.name, stream_id = %id, "Stream registered");
        }

        Ok(supervisor)
    }

    /// Build with injected detector and clip factory. Used by tests and by
    /// anyone embedding the engine with a different backend.
    pub fn with_components(
        config: Config,
        catalogue: Arc<Catalogue>,
        detector: Arc<dyn Detector>,
        factory: Arc<dyn ClipWriterFactory>,
    ) -> Arc<Self> {
        Arc::new(Supervisor {
            config,
            catalogue,
            detector,
            factory,
            streams: Mutex::new(HashMap::new()),
            janitor: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let janitor = StorageJanitor::new(
            &self.config.storage.recordings_dir,
            self.config.storage.max_storage_bytes(),
            self.catalogue.clone(),
            Arc::new(move || {
                weak.upgrade()
                    .map(|sup| sup.live_recorder_paths())
                    .unwrap_or_default()
            }),
        );
        let period = Duration::from_secs(self.config.storage.janitor_interval_secs);
        *self.janitor.lock() = Some(janitor.spawn(period));
        info!(period_secs = period.as_secs(), "Storage janitor started");
    }

    /// Construct ring, recorder and pipeline for one stream and start it.
    pub fn register_stream(self: &Arc<Self>, stream_cfg: &StreamConfig) -> Uuid {
        let stream_id = Uuid::new_v4();
        let rec = &self.config.recording;

        let ring = Arc::new(FrameRing::new(rec.pre_buffer_seconds, rec.fps));
        let recorder = Arc::new(EventRecorder::new(
            stream_id,
            &stream_cfg.name,
            RecorderParams {
                pre_buffer_seconds: rec.pre_buffer_seconds,
                post_buffer_seconds: rec.post_buffer_seconds,
                min_confidence: rec.min_confidence,
                fps: rec.fps,
                min_gap_secs: rec.min_gap_secs,
                record_objects: rec.record_objects.clone(),
                recordings_dir: self.config.storage.recordings_dir.clone(),
            },
            ring.clone(),
            self.catalogue.clone(),
            self.factory.clone(),
        ));
        let pipeline = StreamPipeline::start(
            stream_id,
            stream_cfg,
            (self.config.detection.width, self.config.detection.height),
            ring,
            recorder,
            self.detector.clone(),
        );

        self.streams.lock().insert(
            stream_id,
            StreamRegistration { name: stream_cfg.name.clone(), pipeline },
        );
        stream_id
    }

    /// Stop a stream's pipeline, finalizing any live recording, and drop its
    /// registration.
    pub async fn unregister_stream(&self, stream_id: Uuid) -> Result<()> {
        let registration = self
            .streams
            .lock()
            .remove(&stream_id)
            .ok_or(EngineError::StreamNotFound { id: stream_id })?;
        registration.pipeline.stop().await;
        info!(stream = %registration.name, stream_id = %stream_id, "Stream unregistered");
        Ok(())
    }

    /// Status snapshot for every registered stream.
    pub fn stream_statuses(&self) -> Vec<(Uuid, String, PipelineStatus)> {
        self.streams
            .lock()
            .iter()
            .map(|(id, reg)| (*id, reg.name.clone(), reg.pipeline.status()))
            .collect()
    }

    /// Latest-annotated-frame channel for one stream, for MJPEG delivery.
    pub fn annotated_frames(&self, stream_id: Uuid) -> Option<watch::Receiver<Option<Frame>>> {
        self.streams
            .lock()
            .get(&stream_id)
            .map(|reg| reg.pipeline.annotated_frames())
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.config.storage.recordings_dir.clone()
    }

    /// Paths of clips currently being written across all streams.
    pub fn live_recorder_paths(&self) -> Vec<std::path::PathBuf> {
        self.streams
            .lock()
            .values()
            .flat_map(|reg| reg.pipeline.recorder().live_paths())
            .collect()
    }

    /// Force process exit if shutdown has not completed within the grace
    /// period. Arm this when the shutdown signal arrives.
    pub fn arm_watchdog(&self) {
        tokio::spawn(async move {
            tokio::time::sleep(WATCHDOG_GRACE).await;
            warn!("Shutdown watchdog fired, forcing exit");
            std::process::exit(0);
        });
    }

    /// Stop every pipeline, finalize in-flight recordings, stop the janitor.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down");

        let ids: Vec<Uuid> = self.streams.lock().keys().copied().collect();
        for id in ids {
            let _ = self.unregister_stream(id).await;
        }

        if let Some(janitor) = self.janitor.lock().take() {
            janitor.abort();
        }
        info!("Shutdown complete");
    }
}

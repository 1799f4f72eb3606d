// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Object detection.
//!
//! The engine talks to detection through the [`Detector`] trait: a backend
//! takes a frame and returns the annotated frame plus the detections that
//! survived filtering. [`yolo::YoloDetector`] is the ONNX-based production
//! backend; tests substitute their own.

pub mod annotate;
pub mod yolo;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// One detected object, in pixel coordinates of the annotated frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }
}

/// Post-model filtering applied to every frame's detections, in order:
/// confidence, class allow-list, bbox area bounds.
#[derive(Debug, Clone, Default)]
pub struct DetectionFilter {
    pub confidence_threshold: f32,
    /// Empty = keep all classes.
    pub filter_classes: Vec<String>,
    pub min_area: Option<f32>,
    pub max_area: Option<f32>,
}

impl DetectionFilter {
    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .filter(|d| {
                self.filter_classes.is_empty()
                    || self.filter_classes.iter().any(|c| c == &d.class_name)
            })
            .filter(|d| self.min_area.is_none_or(|min| d.area() >= min))
            .filter(|d| self.max_area.is_none_or(|max| d.area() <= max))
            .collect()
    }
}

/// A detection backend.
///
/// `infer` must be pure with respect to its input frame and safe to call from
/// the blocking pool. A failed inference is absorbed by the backend: it logs
/// and returns the input frame untouched with no detections, never an error.
pub trait Detector: Send + Sync {
    /// Run detection on `frame`; returns the annotated frame and the filtered
    /// detections in model output order.
    fn infer(&self, frame: &Frame, fps: u32) -> (Frame, Vec<Detection>);

    /// Class names this backend can produce.
    fn classes(&self) -> &[String];

    /// Identifier of the loaded model, for status output.
    fn model_name(&self) -> &str;
}

/// Highest confidence over a detection list, 0.0 when empty.
pub fn max_confidence(detections: &[Detection]) -> f32 {
    detections.iter().map(|d| d.confidence).fold(0.0, f32::max)
}

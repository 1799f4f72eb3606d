// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! YOLO-family ONNX backend.
//!
//! Runs a single-output YOLOv8-style model (`[1, 4+nc, anchors]`) through ONNX
//! Runtime. The session sits behind a mutex: one inference lane shared by all
//! stream pipelines, since session thread-safety depends on the execution
//! provider.

use std::path::Path;

use bytes::Bytes;
use image::imageops::FilterType;
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::detect::annotate::Annotator;
use crate::detect::{Detection, DetectionFilter, Detector};
use crate::error::{EngineError, Result};
use crate::frame::Frame;

/// Model input resolution (square letterbox).
const INPUT_SIZE: u32 = 640;
/// IoU threshold for non-maximum suppression.
const NMS_IOU: f32 = 0.45;
/// Letterbox padding value.
const PAD_VALUE: u8 = 114;

const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// ONNX Runtime YOLO detector.
pub struct YoloDetector {
    session: Mutex<Session>,
    classes: Vec<String>,
    filter: DetectionFilter,
    annotator: Annotator,
    model_name: String,
}

impl YoloDetector {
    /// Load the model at `model_path`. Failure here is fatal at startup.
    pub fn load(
        model_path: &Path,
        filter: DetectionFilter,
        label_font: &Path,
    ) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| EngineError::Detector(format!("model load: {e}")))?;

        let model_name = model_path.display().to_string();
        info!(model = %model_name, "Detection model loaded");

        Ok(YoloDetector {
            session: Mutex::new(session),
            classes: COCO_LABELS.iter().map(|s| s.to_string()).collect(),
            filter,
            annotator: Annotator::load(label_font),
            model_name,
        })
    }

    fn run_model(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = letterbox(frame)?;

        let tensor = Tensor::from_array((
            [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
            input,
        ))
        .map_err(|e| EngineError::Detector(format!("input tensor: {e}")))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs!["images" => tensor])
            .map_err(|e| EngineError::Detector(format!("inference: {e}")))?;
        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Detector(format!("output tensor: {e}")))?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        if dims.len() != 3 {
            return Err(EngineError::Detector(format!(
                "unexpected output shape {dims:?}"
            )));
        }
        let rows = dims[1] as usize;
        let anchors = dims[2] as usize;
        if rows < 5 || rows - 4 > self.classes.len() {
            return Err(EngineError::Detector(format!(
                "unexpected output shape {dims:?}"
            )));
        }
        let num_classes = rows - 4;

        // Decode: row-major [rows, anchors]; boxes are cxcywh in letterbox
        // space. Keep the best class per anchor above the model threshold.
        let mut candidates: Vec<Detection> = Vec::new();
        for a in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = 0.0f32;
            for c in 0..num_classes {
                let score = data[(4 + c) * anchors + a];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score < self.filter.confidence_threshold {
                continue;
            }
            let cx = data[a];
            let cy = data[anchors + a];
            let w = data[2 * anchors + a];
            let h = data[3 * anchors + a];

            // Map back into frame coordinates.
            let x1 = ((cx - w / 2.0 - pad_x) / scale).clamp(0.0, frame.width as f32);
            let y1 = ((cy - h / 2.0 - pad_y) / scale).clamp(0.0, frame.height as f32);
            let x2 = ((cx + w / 2.0 - pad_x) / scale).clamp(0.0, frame.width as f32);
            let y2 = ((cy + h / 2.0 - pad_y) / scale).clamp(0.0, frame.height as f32);

            candidates.push(Detection {
                class_name: self.classes[best_class].clone(),
                confidence: best_score,
                bbox: [x1, y1, x2, y2],
            });
        }

        Ok(nms(candidates, NMS_IOU))
    }
}

impl Detector for YoloDetector {
    fn infer(&self, frame: &Frame, fps: u32) -> (Frame, Vec<Detection>) {
        let detections = match self.run_model(frame) {
            Ok(d) => self.filter.apply(d),
            Err(e) => {
                // A bad frame never tears the pipeline down; pass it through
                // unannotated.
                warn!(error = %e, "Inference failed for frame");
                return (frame.clone(), Vec::new());
            }
        };
        let annotated = self.annotator.annotate(frame, &detections, fps);
        (annotated, detections)
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Resize keeping aspect ratio onto a padded square, normalized CHW floats.
/// Returns `(chw_pixels, scale, pad_x, pad_y)`.
fn letterbox(frame: &Frame) -> Result<(Vec<f32>, f32, f32, f32)> {
    let img: RgbImage =
        RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())
            .ok_or_else(|| EngineError::Detector("frame buffer size mismatch".into()))?;

    let scale = (INPUT_SIZE as f32 / frame.width as f32)
        .min(INPUT_SIZE as f32 / frame.height as f32);
    let scaled_w = ((frame.width as f32 * scale).round() as u32).max(1);
    let scaled_h = ((frame.height as f32 * scale).round() as u32).max(1);
    let pad_x = ((INPUT_SIZE - scaled_w) / 2) as f32;
    let pad_y = ((INPUT_SIZE - scaled_h) / 2) as f32;

    let resized = image::imageops::resize(&img, scaled_w, scaled_h, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, image::Rgb([PAD_VALUE; 3]));
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let area = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut chw = vec![0.0f32; 3 * area];
    for (i, px) in canvas.pixels().enumerate() {
        chw[i] = px.0[0] as f32 / 255.0;
        chw[area + i] = px.0[1] as f32 / 255.0;
        chw[2 * area + i] = px.0[2] as f32 / 255.0;
    }
    Ok((chw, scale, pad_x, pad_y))
}

/// Per-class non-maximum suppression, highest confidence first.
fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for det in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_name == det.class_name && iou(&k.bbox, &det.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(det);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

// Annotator needs shared pixel buffers; keep the conversion helper here so
// both directions stay next to each other.
pub(crate) fn frame_to_image(frame: &Frame) -> Option<RgbImage> {
    RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())
}

pub(crate) fn image_to_frame(img: RgbImage, like: &Frame) -> Frame {
    Frame {
        mono_ns: like.mono_ns,
        wall_ms: like.wall_ms,
        width: img.width(),
        height: img.height(),
        pixels: Bytes::from(img.into_raw()),
    }
}

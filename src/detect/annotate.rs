//! Frame annotation: detection boxes, label strips, FPS overlay.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::warn;

use crate::detect::yolo::{frame_to_image, image_to_frame};
use crate::detect::Detection;
use crate::frame::Frame;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT: Rgb<u8> = Rgb([0, 0, 0]);
const FPS_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 16.0;
const FPS_SCALE: f32 = 24.0;

static FONT_WARNED: AtomicBool = AtomicBool::new(false);

/// Draws boxes and text onto annotated frames. The font is loaded once at
/// startup; when it cannot be read, boxes are still drawn and text is skipped.
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn load(font_path: &Path) -> Self {
        let font = std::fs::read(font_path)
            .ok()
            .and_then(|bytes| FontVec::try_from_vec(bytes).ok());
        if font.is_none() && !FONT_WARNED.swap(true, Ordering::Relaxed) {
            warn!(path = %font_path.display(), "Label font unavailable, drawing boxes only");
        }
        Annotator { font }
    }

    /// Draw every detection (in order) plus the FPS counter onto a copy of
    /// `frame`.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection], fps: u32) -> Frame {
        let Some(mut img) = frame_to_image(frame) else {
            return frame.clone();
        };

        for det in detections {
            let x1 = det.bbox[0].round() as i32;
            let y1 = det.bbox[1].round() as i32;
            let w = ((det.bbox[2] - det.bbox[0]).round() as i32).max(1) as u32;
            let h = ((det.bbox[3] - det.bbox[1]).round() as i32).max(1) as u32;

            for inset in 0..BOX_THICKNESS {
                let rw = w.saturating_sub(2 * inset as u32);
                let rh = h.saturating_sub(2 * inset as u32);
                if rw == 0 || rh == 0 {
                    break;
                }
                draw_hollow_rect_mut(
                    &mut img,
                    Rect::at(x1 + inset, y1 + inset).of_size(rw, rh),
                    BOX_COLOR,
                );
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", det.class_name, det.confidence);
                let scale = PxScale::from(LABEL_SCALE);
                let (tw, th) = text_size(scale, font, &label);
                let strip_h = th as i32 + 4;
                let strip_y = (y1 - strip_h).max(0);
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at(x1, strip_y).of_size(tw + 8, strip_h as u32),
                    BOX_COLOR,
                );
                draw_text_mut(&mut img, LABEL_TEXT, x1 + 4, strip_y + 2, scale, font, &label);
            }
        }

        if let Some(font) = &self.font {
            draw_text_mut(
                &mut img,
                FPS_COLOR,
                10,
                10,
                PxScale::from(FPS_SCALE),
                font,
                &format!("FPS: {fps}"),
            );
        }

        image_to_frame(img, frame)
    }
}

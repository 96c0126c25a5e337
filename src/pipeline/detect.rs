//! Diagram detection: locate figures on page images.
//!
//! The detector itself is an external program (typically a YOLO wrapper
//! script). [`CommandDetector`] invokes it once per run as
//!
//! ```text
//! <program> [extra args] --weights <weights> --output-dir <dir> <image>...
//! ```
//!
//! and expects a [`PredictionSet`] JSON document on stdout:
//!
//! ```json
//! { "pages": [ { "image": "static/page_images/page_1.png",
//!                "width": 1414, "height": 2000,
//!                "detections": [ { "label": "diagram", "confidence": 0.91,
//!                                  "bbox": { "x1": 120, "y1": 640, "x2": 880, "y2": 1210 } } ] } ] }
//! ```
//!
//! After the call, [`finalize_predictions`] aligns the document with the
//! page order, applies the confidence threshold, persists it and draws the
//! boxes onto copies of the pages.

use crate::config::WorkflowConfig;
use crate::error::Exam2SqlError;
use crate::layout::{page_stem, write_json};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Bounding box in page-image pixels; `(x1, y1)` top-left, `(x2, y2)`
/// bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Clamp to a `width × height` image and round outward to whole pixels.
    /// Returns `(x, y, w, h)`, or `None` when less than one pixel remains.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32);
        let (x1, x2) = (
            clamp(self.x1.min(self.x2), width),
            clamp(self.x1.max(self.x2), width),
        );
        let (y1, y2) = (
            clamp(self.y1.min(self.y2), height),
            clamp(self.y1.max(self.y2), height),
        );

        let (left, top) = (x1.floor() as u32, y1.floor() as u32);
        let (right, bottom) = (x2.ceil() as u32, y2.ceil() as u32);
        if right <= left || bottom <= top {
            return None;
        }
        Some((left, top, right - left, bottom - top))
    }
}

fn default_label() -> String {
    "diagram".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default = "default_label")]
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePredictions {
    pub image: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// Bounding-box predictions for every page of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    pub pages: Vec<PagePredictions>,
}

impl PredictionSet {
    pub fn detection_count(&self) -> usize {
        self.pages.iter().map(|p| p.detections.len()).sum()
    }

    /// Reorder to match `images`: pages the detector omitted get an empty
    /// entry, predictions for unknown images are dropped. Images are matched
    /// by file name, since detectors often report absolute paths.
    pub fn align_to(self, images: &[PathBuf]) -> PredictionSet {
        let mut by_name: HashMap<String, PagePredictions> = HashMap::new();
        for page in self.pages {
            let name = file_name(&page.image);
            if !images.iter().any(|i| file_name(i) == name) {
                warn!(
                    "Detector reported unknown image {}; ignoring",
                    page.image.display()
                );
                continue;
            }
            by_name.insert(name, page);
        }

        let pages = images
            .iter()
            .map(|image| match by_name.remove(&file_name(image)) {
                Some(mut p) => {
                    p.image = image.clone();
                    p
                }
                None => {
                    debug!("No predictions for {}; assuming none", image.display());
                    PagePredictions {
                        image: image.clone(),
                        width: None,
                        height: None,
                        detections: Vec::new(),
                    }
                }
            })
            .collect();

        PredictionSet { pages }
    }

    /// Drop detections below `threshold`.
    pub fn filter_confidence(mut self, threshold: f32) -> PredictionSet {
        for page in &mut self.pages {
            page.detections.retain(|d| d.confidence >= threshold);
        }
        self
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Finds diagrams on page images.
#[async_trait]
pub trait DiagramDetector: Send + Sync {
    /// Run over all `images` (in page order) with `weights`, writing any
    /// detector-side artifacts to `out_dir`.
    async fn detect(
        &self,
        images: &[PathBuf],
        weights: &Path,
        out_dir: &Path,
    ) -> Result<PredictionSet, Exam2SqlError>;
}

/// Detector run as an external command that prints predictions JSON.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(&config.detector_program, config.detector_args.clone())
    }
}

#[async_trait]
impl DiagramDetector for CommandDetector {
    async fn detect(
        &self,
        images: &[PathBuf],
        weights: &Path,
        out_dir: &Path,
    ) -> Result<PredictionSet, Exam2SqlError> {
        info!(
            "Running detector {} on {} images",
            self.program, images.len()
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--weights")
            .arg(weights)
            .arg("--output-dir")
            .arg(out_dir)
            .args(images)
            .output()
            .await
            .map_err(|e| Exam2SqlError::DetectionFailed {
                detail: format!("failed to run {}: {}", self.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Exam2SqlError::DetectionFailed {
                detail: format!(
                    "{} exited with {}: {}",
                    self.program, output.status, stderr.trim()
                ),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| Exam2SqlError::DetectionFailed {
            detail: format!("invalid predictions JSON: {e}"),
        })
    }
}

/// Align, filter, persist and annotate raw detector output.
///
/// Writes `predictions_path` and `<stem>_boxed.png` into `boxes_dir` for
/// every page with at least one detection.
pub async fn finalize_predictions(
    raw: PredictionSet,
    images: &[PathBuf],
    threshold: f32,
    predictions_path: &Path,
    boxes_dir: &Path,
) -> Result<PredictionSet, Exam2SqlError> {
    let predictions = raw.align_to(images).filter_confidence(threshold);
    write_json(predictions_path, &predictions)?;

    let to_draw = predictions.clone();
    let boxes_dir = boxes_dir.to_path_buf();
    tokio::task::spawn_blocking(move || annotate_pages(&to_draw, &boxes_dir))
        .await
        .map_err(|e| Exam2SqlError::Internal(format!("Annotation task panicked: {}", e)))??;

    info!(
        "{} diagrams detected across {} pages",
        predictions.detection_count(),
        predictions.pages.len()
    );
    Ok(predictions)
}

const BOX_COLOUR: Rgba<u8> = Rgba([230, 30, 30, 255]);
const BOX_THICKNESS: u32 = 3;

/// Draw every detection onto a copy of its page.
pub fn annotate_pages(
    predictions: &PredictionSet,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, Exam2SqlError> {
    std::fs::create_dir_all(out_dir).map_err(|e| Exam2SqlError::io(out_dir, e))?;

    let mut written = Vec::new();
    for page in predictions.pages.iter().filter(|p| !p.detections.is_empty()) {
        let mut img = image::open(&page.image)
            .map_err(|e| Exam2SqlError::ImageFailed {
                path: page.image.clone(),
                detail: e.to_string(),
            })?
            .to_rgba8();

        for det in &page.detections {
            if let Some(rect) = det.bbox.to_pixel_rect(img.width(), img.height()) {
                draw_rect_outline(&mut img, rect, BOX_COLOUR, BOX_THICKNESS);
            }
        }

        let path = out_dir.join(format!("{}_boxed.png", page_stem(&page.image)));
        img.save(&path).map_err(|e| Exam2SqlError::ImageFailed {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        written.push(path);
    }
    Ok(written)
}

/// Outline `(x, y, w, h)` with `thickness` nested one-pixel rectangles,
/// growing inward.
fn draw_rect_outline(
    img: &mut RgbaImage,
    (x, y, w, h): (u32, u32, u32, u32),
    colour: Rgba<u8>,
    thickness: u32,
) {
    for inset in 0..thickness {
        let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
        if iw == 0 || ih == 0 {
            break;
        }
        let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(iw, ih);
        draw_hollow_rect_mut(img, rect, colour);
    }
}

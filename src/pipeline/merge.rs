//! Merge OCR text and diagram detections into one document per run.
//!
//! For every page in the prediction set this reads `<stem>.txt` from the
//! OCR directory and crops each detection out of the page image into
//! `<stem>_diagram_<k>.png`. The result is written as `diagram_info.json`
//! and is the only input of the LLM stage.

use crate::error::Exam2SqlError;
use crate::layout::{page_stem, write_json};
use crate::pipeline::detect::{BoundingBox, PredictionSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One cropped diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramCrop {
    /// `<stem>_diagram_<k>`, unique within the run.
    pub id: String,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub crop: PathBuf,
}

/// Text and diagrams of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramPage {
    /// Image stem, e.g. `page_1`.
    pub page: String,
    /// 1-based position in the document.
    pub page_number: usize,
    pub image: PathBuf,
    pub text: String,
    /// True when no OCR text file existed and `text` is a placeholder.
    #[serde(default)]
    pub ocr_missing: bool,
    pub diagrams: Vec<DiagramCrop>,
}

/// The diagram-info document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramInfo {
    pub run_id: String,
    pub pages: Vec<DiagramPage>,
}

impl DiagramInfo {
    pub fn diagram_count(&self) -> usize {
        self.pages.iter().map(|p| p.diagrams.len()).sum()
    }
}

/// Build the diagram-info document and write it to `out_path`.
///
/// Cropping is CPU-bound and runs on a blocking thread.
pub async fn merge_page_data(
    run_id: &str,
    predictions: &PredictionSet,
    text_dir: &Path,
    crop_dir: &Path,
    out_path: &Path,
) -> Result<DiagramInfo, Exam2SqlError> {
    let run_id = run_id.to_string();
    let predictions = predictions.clone();
    let text_dir = text_dir.to_path_buf();
    let crop_dir = crop_dir.to_path_buf();

    let info = tokio::task::spawn_blocking(move || {
        build_diagram_info(&run_id, &predictions, &text_dir, &crop_dir)
    })
    .await
    .map_err(|e| Exam2SqlError::Internal(format!("Merge task panicked: {}", e)))??;

    write_json(out_path, &info)?;
    info!(
        "Diagram info written to {} ({} pages, {} diagrams)",
        out_path.display(),
        info.pages.len(),
        info.diagram_count()
    );
    Ok(info)
}

fn build_diagram_info(
    run_id: &str,
    predictions: &PredictionSet,
    text_dir: &Path,
    crop_dir: &Path,
) -> Result<DiagramInfo, Exam2SqlError> {
    std::fs::create_dir_all(crop_dir).map_err(|e| Exam2SqlError::io(crop_dir, e))?;

    let mut pages = Vec::with_capacity(predictions.pages.len());
    for (idx, page) in predictions.pages.iter().enumerate() {
        let stem = page_stem(&page.image);
        let (text, ocr_missing) = read_page_text(&text_dir.join(format!("{stem}.txt")))?;

        let mut diagrams = Vec::new();
        if !page.detections.is_empty() {
            let img = image::open(&page.image).map_err(|e| Exam2SqlError::ImageFailed {
                path: page.image.clone(),
                detail: e.to_string(),
            })?;

            for det in &page.detections {
                let Some((x, y, w, h)) = det.bbox.to_pixel_rect(img.width(), img.height()) else {
                    warn!("{}: skipping degenerate box {:?}", stem, det.bbox);
                    continue;
                };
                let id = format!("{}_diagram_{}", stem, diagrams.len() + 1);
                let crop = crop_dir.join(format!("{id}.png"));
                img.crop_imm(x, y, w, h)
                    .save(&crop)
                    .map_err(|e| Exam2SqlError::ImageFailed {
                        path: crop.clone(),
                        detail: e.to_string(),
                    })?;
                debug!("Cropped {} → {}x{} at {}", id, w, h, crop.display());

                diagrams.push(DiagramCrop {
                    id,
                    label: det.label.clone(),
                    confidence: det.confidence,
                    bbox: det.bbox,
                    crop,
                });
            }
        }

        pages.push(DiagramPage {
            page: stem,
            page_number: idx + 1,
            image: page.image.clone(),
            text,
            ocr_missing,
            diagrams,
        });
    }

    Ok(DiagramInfo {
        run_id: run_id.to_string(),
        pages,
    })
}

/// A missing text file yields an empty placeholder; any other read error
/// is fatal.
fn read_page_text(path: &Path) -> Result<(String, bool), Exam2SqlError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok((text, false)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No OCR text at {}; using empty placeholder", path.display());
            Ok((String::new(), true))
        }
        Err(e) => Err(Exam2SqlError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detect::{Detection, PagePredictions};
    use image::{Rgba, RgbaImage};

    fn setup(dir: &Path, pages: usize) -> Vec<PathBuf> {
        let images_dir = dir.join("page_images");
        std::fs::create_dir_all(&images_dir).unwrap();
        (1..=pages)
            .map(|n| {
                let p = images_dir.join(format!("page_{n}.png"));
                RgbaImage::from_pixel(100, 80, Rgba([255, 255, 255, 255]))
                    .save(&p)
                    .unwrap();
                p
            })
            .collect()
    }

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            label: "diagram".into(),
            confidence: 0.9,
            bbox: BoundingBox { x1, y1, x2, y2 },
        }
    }

    #[tokio::test]
    async fn merges_text_and_crops() {
        let tmp = tempfile::tempdir().unwrap();
        let images = setup(tmp.path(), 2);
        let text_dir = tmp.path().join("ocr_text");
        std::fs::create_dir_all(&text_dir).unwrap();
        std::fs::write(text_dir.join("page_1.txt"), "Q1. Label the figure").unwrap();
        std::fs::write(text_dir.join("page_2.txt"), "Q2. No figure").unwrap();

        let predictions = PredictionSet {
            pages: vec![
                PagePredictions {
                    image: images[0].clone(),
                    width: None,
                    height: None,
                    detections: vec![
                        detection(10.0, 10.0, 50.0, 40.0),
                        detection(60.0, 50.0, 150.0, 120.0),
                    ],
                },
                PagePredictions {
                    image: images[1].clone(),
                    width: None,
                    height: None,
                    detections: vec![],
                },
            ],
        };
        let crops = tmp.path().join("crops");
        let out = tmp.path().join("diagram_info.json");

        let info = merge_page_data("run1", &predictions, &text_dir, &crops, &out)
            .await
            .unwrap();

        assert_eq!(info.pages.len(), 2);
        assert_eq!(info.pages[0].text, "Q1. Label the figure");
        assert_eq!(info.pages[1].page_number, 2);
        assert_eq!(info.diagram_count(), 2);

        let second = image::open(&info.pages[0].diagrams[1].crop).unwrap();
        // Clamped to the 100x80 page.
        assert_eq!((second.width(), second.height()), (40, 30));
        assert_eq!(info.pages[0].diagrams[0].id, "page_1_diagram_1");

        let on_disk: DiagramInfo = crate::layout::read_json(&out).unwrap();
        assert_eq!(on_disk, info);
    }

    #[tokio::test]
    async fn missing_text_gets_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let images = setup(tmp.path(), 1);
        let predictions = PredictionSet {
            pages: vec![PagePredictions {
                image: images[0].clone(),
                width: None,
                height: None,
                detections: vec![detection(0.0, 0.0, 10.0, 10.0)],
            }],
        };
        let out = tmp.path().join("diagram_info.json");

        let info = merge_page_data(
            "run1",
            &predictions,
            &tmp.path().join("no_text_here"),
            &tmp.path().join("crops"),
            &out,
        )
        .await
        .unwrap();

        assert!(info.pages[0].ocr_missing);
        assert!(info.pages[0].text.is_empty());
        assert_eq!(info.pages[0].diagrams.len(), 1);
    }

    #[tokio::test]
    async fn degenerate_boxes_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let images = setup(tmp.path(), 1);
        let text_dir = tmp.path().join("ocr_text");
        std::fs::create_dir_all(&text_dir).unwrap();
        std::fs::write(text_dir.join("page_1.txt"), "text").unwrap();
        let predictions = PredictionSet {
            pages: vec![PagePredictions {
                image: images[0].clone(),
                width: None,
                height: None,
                detections: vec![
                    detection(200.0, 200.0, 300.0, 300.0),
                    detection(5.0, 5.0, 25.0, 25.0),
                ],
            }],
        };

        let info = merge_page_data(
            "run1",
            &predictions,
            &text_dir,
            &tmp.path().join("crops"),
            &tmp.path().join("diagram_info.json"),
        )
        .await
        .unwrap();

        assert_eq!(info.pages[0].diagrams.len(), 1);
        assert_eq!(info.pages[0].diagrams[0].id, "page_1_diagram_1");
    }
}

//! OCR: page image → page text, persisted as one `.txt` per page.
//!
//! The default engine shells out to `tesseract` and asks for TSV output,
//! which carries word boxes and confidences. The plain text is rebuilt from
//! the TSV hierarchy (block → paragraph → line → word), so a single
//! invocation yields both the text and the word-level detail.

use crate::config::WorkflowConfig;
use crate::error::Exam2SqlError;
use crate::layout::page_stem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// OCR result for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrPage {
    pub text: String,
    /// Word-level detail. Not used downstream.
    pub words: Vec<OcrWord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

/// Extracts text from a page image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &Path) -> Result<OcrPage, Exam2SqlError>;
}

/// Run OCR over every page image and write `<stem>.txt` into `text_dir`.
///
/// Pages are processed in order; the first failure aborts the stage.
/// Returns the text file paths in page order.
pub async fn run_ocr(
    engine: &dyn OcrEngine,
    images: &[PathBuf],
    text_dir: &Path,
) -> Result<Vec<PathBuf>, Exam2SqlError> {
    tokio::fs::create_dir_all(text_dir)
        .await
        .map_err(|e| Exam2SqlError::io(text_dir, e))?;

    let mut written = Vec::with_capacity(images.len());
    for image in images {
        let page = engine.recognize(image).await?;
        let path = text_dir.join(format!("{}.txt", page_stem(image)));
        tokio::fs::write(&path, page.text.as_bytes())
            .await
            .map_err(|e| Exam2SqlError::io(&path, e))?;
        debug!(
            "OCR {} → {} chars, {} words",
            image.display(),
            page.text.len(),
            page.words.len()
        );
        written.push(path);
    }

    info!("OCR wrote {} text files", written.len());
    Ok(written)
}

/// OCR engine backed by the `tesseract` command-line tool.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: String,
    language: String,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(&config.tesseract_bin, &config.ocr_language)
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image: &Path) -> Result<OcrPage, Exam2SqlError> {
        let output = Command::new(&self.binary)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("tsv")
            .output()
            .await
            .map_err(|e| Exam2SqlError::OcrFailed {
                image: image.to_path_buf(),
                detail: format!("failed to run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Exam2SqlError::OcrFailed {
                image: image.to_path_buf(),
                detail: format!(
                    "{} exited with {}: {}",
                    self.binary, output.status, stderr.trim()
                ),
            });
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse tesseract TSV output into text and words.
///
/// Only level-5 (word) rows contribute. A new line starts a new text line;
/// a new paragraph or block is separated by a blank line. Malformed rows
/// are ignored.
pub fn parse_tsv(tsv: &str) -> OcrPage {
    let mut page = OcrPage::default();
    let mut last_key: Option<(u32, u32, u32)> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<u32>().ok();
        let (Some(block), Some(par), Some(line)) = (num(2), num(3), num(4)) else {
            continue;
        };

        let key = (block, par, line);
        match last_key {
            None => {}
            Some((b, p, _)) if (b, p) != (block, par) => page.text.push_str("\n\n"),
            Some(prev) if prev != key => page.text.push('\n'),
            Some(_) => page.text.push(' '),
        }
        page.text.push_str(text);
        last_key = Some(key);

        page.words.push(OcrWord {
            text: text.to_string(),
            left: num(6).unwrap_or(0),
            top: num(7).unwrap_or(0),
            width: num(8).unwrap_or(0),
            height: num(9).unwrap_or(0),
            confidence: cols[10].trim().parse().unwrap_or(-1.0),
        });
    }

    page
}

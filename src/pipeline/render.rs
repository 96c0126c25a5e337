//! PDF rasterisation: one PNG per page, in page order.
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which is not
//! safe to drive from async contexts. [`PdfiumRasterizer`] therefore does
//! all of its work inside `tokio::task::spawn_blocking`.
//!
//! Pages are capped on their longest edge (`max_rendered_pixels`) rather
//! than rendered at a fixed DPI, so an oversized page cannot exhaust memory.

use crate::config::WorkflowConfig;
use crate::error::Exam2SqlError;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Converts a PDF into page images.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render every page of `pdf` into `out_dir` and return the image paths
    /// in page order.
    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, Exam2SqlError>;
}

/// File name of a rendered page (1-indexed).
pub fn page_image_name(page_num: usize) -> String {
    format!("page_{page_num}.png")
}

/// Rasteriser backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    max_pixels: u32,
    library: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(max_pixels: u32, library: Option<PathBuf>) -> Self {
        Self {
            max_pixels,
            library,
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(config.max_rendered_pixels, config.pdfium_library.clone())
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn rasterize(&self, pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, Exam2SqlError> {
        let pdf = pdf.to_path_buf();
        let out_dir = out_dir.to_path_buf();
        let max_pixels = self.max_pixels;
        let library = self.library.clone();

        tokio::task::spawn_blocking(move || {
            render_pages_blocking(&pdf, &out_dir, max_pixels, library.as_deref())
        })
        .await
        .map_err(|e| Exam2SqlError::Internal(format!("Render task panicked: {}", e)))?
    }
}

fn bind_pdfium(library: Option<&Path>) -> Result<Pdfium, Exam2SqlError> {
    let bindings = match library {
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| Exam2SqlError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Blocking implementation of page rendering.
fn render_pages_blocking(
    pdf_path: &Path,
    out_dir: &Path,
    max_pixels: u32,
    library: Option<&Path>,
) -> Result<Vec<PathBuf>, Exam2SqlError> {
    let pdfium = bind_pdfium(library)?;

    let document =
        pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| Exam2SqlError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: format!("{:?}", e),
            })?;

    std::fs::create_dir_all(out_dir).map_err(|e| Exam2SqlError::io(out_dir, e))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::with_capacity(total_pages);

    for (idx, page) in pages.iter().enumerate() {
        let page_num = idx + 1;
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            Exam2SqlError::RasterisationFailed {
                page: page_num,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        let path = out_dir.join(page_image_name(page_num));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| Exam2SqlError::RasterisationFailed {
                page: page_num,
                detail: e.to_string(),
            })?;

        debug!(
            "Rendered page {} → {}x{} px at {}",
            page_num,
            image.width(),
            image.height(),
            path.display()
        );
        images.push(path);
    }

    if images.is_empty() {
        return Err(Exam2SqlError::NoPagesRendered {
            path: pdf_path.to_path_buf(),
        });
    }

    Ok(images)
}

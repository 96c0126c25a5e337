//! Image encoding: page PNG on disk → base64 `ImageData` for the LLM.
//!
//! Pages are sent as lossless PNG with `detail: "high"`; fine print in exam
//! questions (exponents, units, option labels) does not survive JPEG
//! artefacts or a single low-resolution tile.

use crate::error::Exam2SqlError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Encode an in-memory image as a base64 PNG.
pub fn encode_image(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Encode an image file. PNG files are passed through without re-encoding.
pub async fn encode_file(path: &Path) -> Result<ImageData, Exam2SqlError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Exam2SqlError::io(path, e))?;

    if bytes.starts_with(b"\x89PNG") {
        return Ok(ImageData::new(STANDARD.encode(&bytes), "image/png").with_detail("high"));
    }

    let img = image::load_from_memory(&bytes).map_err(|e| Exam2SqlError::ImageFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    encode_image(&img).map_err(|e| Exam2SqlError::ImageFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

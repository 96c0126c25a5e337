//! Error types for the exam2sql library.
//!
//! Two error types reflect the two failure modes of the workflow:
//!
//! * [`Exam2SqlError`] (**fatal**): the current action (upload-and-process or
//!   generate-SQL) stops. Failures raised inside a stage are wrapped in
//!   [`Exam2SqlError::StageFailed`] so the caller always knows which stage
//!   aborted the action.
//!
//! * [`SkippedFile`] (**non-fatal**): one response file could not be used
//!   during aggregation. It is reported and collected in
//!   [`crate::pipeline::aggregate::Aggregation::skipped`] while the remaining
//!   files are still merged.

use crate::progress::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the exam2sql library.
#[derive(Debug, Error)]
pub enum Exam2SqlError {
    // ── Intake errors ─────────────────────────────────────────────────────
    /// The selection was empty.
    #[error("No file selected")]
    NoFileSelected,

    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Rasterisation errors ──────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error("Failed to bind to pdfium library: {0}\nSet PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.")]
    PdfiumBindingFailed(String),

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The rasteriser finished but produced nothing.
    #[error("No images generated from the PDF '{path}'")]
    NoPagesRendered { path: PathBuf },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// OCR failed for one page image.
    #[error("OCR failed for '{image}': {detail}")]
    OcrFailed { image: PathBuf, detail: String },

    /// The diagram detector could not be run or exited with an error.
    #[error("Diagram detection failed: {detail}")]
    DetectionFailed { detail: String },

    /// Image decoding, cropping or annotation failed.
    #[error("Image processing failed for '{path}': {detail}")]
    ImageFailed { path: PathBuf, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The LLM API returned an error.
    #[error("LLM API error: {message}")]
    LlmApiError { message: String },

    /// The LLM call timed out.
    #[error("LLM call timed out after {secs}s")]
    LlmTimeout { secs: u64 },

    /// The reply for a page could not be turned into records.
    #[error("Unusable LLM response for {page}: {detail}")]
    InvalidLlmResponse { page: String, detail: String },

    // ── Aggregation / SQL errors ──────────────────────────────────────────
    /// Aggregation found no list-typed JSON data.
    #[error("No valid JSON data found in '{dir}'")]
    NoResponseData { dir: PathBuf },

    /// The SQL generator failed.
    #[error("SQL generation failed: {detail}")]
    SqlGenerationFailed { detail: String },

    /// The SQL action was requested before any run succeeded.
    #[error("SQL generation is not available until a PDF has been processed successfully")]
    SqlNotReady,

    /// No manifest exists for the requested run id.
    #[error("No manifest found for run '{run_id}'")]
    UnknownRun { run_id: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Reading or writing a workspace file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be read or written.
    #[error("Invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Stage wrapper ─────────────────────────────────────────────────────
    /// A stage failed; the action was aborted at that stage.
    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<Exam2SqlError>,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Exam2SqlError {
    /// Build an [`Exam2SqlError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an [`Exam2SqlError::Json`] for `path`.
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Wrap `self` as a failure of `stage`. Already-wrapped errors keep
    /// their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            wrapped @ Self::StageFailed { .. } => wrapped,
            other => Self::StageFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage that failed, if this error came out of a stage.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The underlying error with any stage wrapper removed.
    pub fn root(&self) -> &Exam2SqlError {
        match self {
            Self::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// A response file left out of the merged collection.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {reason}", file.display())]
pub struct SkippedFile {
    pub file: PathBuf,
    pub reason: SkipReason,
}

/// Why a response file was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SkipReason {
    /// The file could not be read.
    #[error("unreadable: {0}")]
    Unreadable(String),

    /// The content is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Valid JSON, but the top-level value is not a list.
    #[error("top-level value is {kind}, expected a list")]
    NotAList { kind: String },
}

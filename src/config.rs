//! Configuration for the exam-to-SQL workflow.
//!
//! Every knob of every stage lives in [`WorkflowConfig`], built with
//! [`WorkflowConfig::builder()`]. Collaborator implementations read their
//! settings from here, so one value describes a complete run.

use crate::error::Exam2SqlError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Label used for the SQL output file when none is given.
pub const DEFAULT_SQL_LABEL: &str = "exam_2024.pdf";

/// Configuration for both user actions.
///
/// # Example
/// ```rust
/// use exam2sql::{SqlMode, WorkflowConfig};
///
/// let config = WorkflowConfig::builder()
///     .workspace_root("/tmp/exam-run")
///     .ocr_language("eng+fra")
///     .sql_mode(SqlMode::Template)
///     .build()
///     .unwrap();
/// assert_eq!(config.sql_table, "questions");
/// ```
#[derive(Clone)]
pub struct WorkflowConfig {
    /// Root directory all workspace folders are created under. Default: `.`.
    pub workspace_root: PathBuf,

    // ── Rasterizer ────────────────────────────────────────────────────────
    /// Longest edge of a rendered page in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Path to a pdfium shared library. `None` binds the system library.
    pub pdfium_library: Option<PathBuf>,

    // ── OCR ───────────────────────────────────────────────────────────────
    /// Tesseract executable. Default: `tesseract`.
    pub tesseract_bin: String,

    /// Tesseract language string, e.g. `eng` or `eng+hin`. Default: `eng`.
    pub ocr_language: String,

    // ── Detector ──────────────────────────────────────────────────────────
    /// Detector program, invoked once per run with all page images.
    /// Default: `detect-diagrams`.
    pub detector_program: String,

    /// Extra arguments placed before the standard detector arguments.
    pub detector_args: Vec<String>,

    /// Model weights handed to the detector. Default: `best.pt`.
    pub model_weights: PathBuf,

    /// Detections below this confidence are discarded. Default: 0.25.
    pub confidence_threshold: f32,

    // ── LLM ───────────────────────────────────────────────────────────────
    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Retries for a failed LLM call. Default: 0.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call LLM timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Custom page-extraction system prompt. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// Send the rendered page image along with the OCR text. Default: true.
    pub attach_page_images: bool,

    // ── Intake ────────────────────────────────────────────────────────────
    /// Download timeout for URL selections in seconds. Default: 120.
    pub download_timeout_secs: u64,

    // ── SQL ───────────────────────────────────────────────────────────────
    /// Label the SQL file is named after. Default: `exam_2024.pdf`.
    pub sql_label: String,

    /// How SQL text is produced. Default: [`SqlMode::Template`].
    pub sql_mode: SqlMode,

    /// Target table for template SQL. Default: `questions`.
    pub sql_table: String,

    /// Emit a `CREATE TABLE IF NOT EXISTS` before the inserts. Default: true.
    pub create_table: bool,

    /// Which response files a session's SQL action reads. Default:
    /// [`ResponseScope::CurrentRun`].
    pub response_scope: ResponseScope,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            max_rendered_pixels: 2000,
            pdfium_library: None,
            tesseract_bin: "tesseract".to_string(),
            ocr_language: "eng".to_string(),
            detector_program: "detect-diagrams".to_string(),
            detector_args: Vec::new(),
            model_weights: PathBuf::from("best.pt"),
            confidence_threshold: 0.25,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 0,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            system_prompt: None,
            attach_page_images: true,
            download_timeout_secs: 120,
            sql_label: DEFAULT_SQL_LABEL.to_string(),
            sql_mode: SqlMode::default(),
            sql_table: "questions".to_string(),
            create_table: true,
            response_scope: ResponseScope::default(),
        }
    }
}

impl fmt::Debug for WorkflowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowConfig")
            .field("workspace_root", &self.workspace_root)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pdfium_library", &self.pdfium_library)
            .field("tesseract_bin", &self.tesseract_bin)
            .field("ocr_language", &self.ocr_language)
            .field("detector_program", &self.detector_program)
            .field("detector_args", &self.detector_args)
            .field("model_weights", &self.model_weights)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("attach_page_images", &self.attach_page_images)
            .field("sql_label", &self.sql_label)
            .field("sql_mode", &self.sql_mode)
            .field("sql_table", &self.sql_table)
            .field("create_table", &self.create_table)
            .field("response_scope", &self.response_scope)
            .finish()
    }
}

impl WorkflowConfig {
    /// Create a new builder for `WorkflowConfig`.
    pub fn builder() -> WorkflowConfigBuilder {
        WorkflowConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WorkflowConfig`].
#[derive(Debug)]
pub struct WorkflowConfigBuilder {
    config: WorkflowConfig,
}

impl WorkflowConfigBuilder {
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = root.into();
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library = Some(path.into());
        self
    }

    pub fn tesseract_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.tesseract_bin = bin.into();
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn detector_program(mut self, program: impl Into<String>) -> Self {
        self.config.detector_program = program.into();
        self
    }

    pub fn detector_args(mut self, args: Vec<String>) -> Self {
        self.config.detector_args = args;
        self
    }

    pub fn model_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_weights = path.into();
        self
    }

    pub fn confidence_threshold(mut self, t: f32) -> Self {
        self.config.confidence_threshold = t;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn attach_page_images(mut self, v: bool) -> Self {
        self.config.attach_page_images = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn sql_label(mut self, label: impl Into<String>) -> Self {
        self.config.sql_label = label.into();
        self
    }

    pub fn sql_mode(mut self, mode: SqlMode) -> Self {
        self.config.sql_mode = mode;
        self
    }

    pub fn sql_table(mut self, table: impl Into<String>) -> Self {
        self.config.sql_table = table.into();
        self
    }

    pub fn create_table(mut self, v: bool) -> Self {
        self.config.create_table = v;
        self
    }

    pub fn response_scope(mut self, scope: ResponseScope) -> Self {
        self.config.response_scope = scope;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkflowConfig, Exam2SqlError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(Exam2SqlError::InvalidConfig(format!(
                "Confidence threshold must be 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if c.sql_label.trim().is_empty() {
            return Err(Exam2SqlError::InvalidConfig(
                "SQL label must not be empty".into(),
            ));
        }
        if c.sql_label.contains(['/', '\\']) {
            return Err(Exam2SqlError::InvalidConfig(format!(
                "SQL label must be a file name, got '{}'",
                c.sql_label
            )));
        }
        if c.sql_table.trim().is_empty() {
            return Err(Exam2SqlError::InvalidConfig(
                "SQL table name must not be empty".into(),
            ));
        }
        if c.ocr_language.trim().is_empty() {
            return Err(Exam2SqlError::InvalidConfig(
                "OCR language must not be empty".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(Exam2SqlError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the SQL text is produced from the merged collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SqlMode {
    /// Deterministic `INSERT` statements, one per record. (default)
    #[default]
    Template,
    /// Ask the language model to write the SQL.
    Llm,
}

impl FromStr for SqlMode {
    type Err = Exam2SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "template" => Ok(SqlMode::Template),
            "llm" => Ok(SqlMode::Llm),
            other => Err(Exam2SqlError::InvalidConfig(format!(
                "Unknown SQL mode '{other}' (expected template or llm)"
            ))),
        }
    }
}

/// Which response files the session's SQL action aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseScope {
    /// Only the files written by the last successful run. (default)
    #[default]
    CurrentRun,
    /// Every JSON file in the responses directory.
    AllResponses,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = WorkflowConfig::default();
        assert_eq!(c.sql_label, "exam_2024.pdf");
        assert_eq!(c.max_retries, 0);
        assert_eq!(c.model_weights, PathBuf::from("best.pt"));
        assert_eq!(c.sql_mode, SqlMode::Template);
        assert_eq!(c.response_scope, ResponseScope::CurrentRun);
    }

    #[test]
    fn builder_rejects_bad_threshold() {
        let err = WorkflowConfig::builder()
            .confidence_threshold(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Confidence threshold"));
    }

    #[test]
    fn builder_rejects_path_label() {
        assert!(WorkflowConfig::builder()
            .sql_label("../escape")
            .build()
            .is_err());
        assert!(WorkflowConfig::builder().sql_label("  ").build().is_err());
    }

    #[test]
    fn builder_clamps_temperature() {
        let c = WorkflowConfig::builder().temperature(9.0).build().unwrap();
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn sql_mode_parses() {
        assert_eq!("Template".parse::<SqlMode>().unwrap(), SqlMode::Template);
        assert_eq!(" llm ".parse::<SqlMode>().unwrap(), SqlMode::Llm);
        assert!("gpt".parse::<SqlMode>().is_err());
    }

    #[test]
    fn debug_hides_provider() {
        let s = format!("{:?}", WorkflowConfig::default());
        assert!(s.contains("WorkflowConfig"));
        assert!(s.contains("sql_label"));
    }
}

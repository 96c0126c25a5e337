//! # exam2sql
//!
//! Turn printed exam papers (PDF) into SQL insert statements.
//!
//! ## Why this crate?
//!
//! Exam papers mix question text, multiple-choice options and figures.
//! Plain text extraction loses which figure belongs to which question, and
//! typing questions into a database by hand does not scale. This crate
//! chains OCR, diagram detection and a hosted language model to recover
//! structured question records page by page, then writes them out as SQL.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Upload     copy (or download) into uploads/<token>.pdf
//!  ├─ 2. Render     rasterise pages via pdfium (spawn_blocking)
//!  ├─ 3. OCR        tesseract → static/ocr_text/page_<n>.txt
//!  ├─ 4. Detect     diagram boxes → predictions.json, boxed pages
//!  ├─ 5. Merge      text + cropped diagrams → diagram_info.json
//!  └─ 6. LLM        one call per page → responses/<run>_page_<n>.json
//!
//! Generate SQL
//!  ├─ 7. Aggregate  response lists → responses/merged_data.json
//!  └─ 8. SQL        sql_outputs/<label>_output.sql
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam2sql::{AggregationScope, StatusLog, Workflow, WorkflowConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let workflow = Workflow::new(WorkflowConfig::default())?;
//!     let log = StatusLog::new();
//!
//!     let run = workflow.process_pdf("exam.pdf", &log).await?;
//!     let sql = workflow
//!         .generate_sql(AggregationScope::Run(run.manifest), &log)
//!         .await?;
//!     println!("{}", sql.sql);
//!     eprint!("{}", log.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam2sql` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! exam2sql = { version = "0.1", default-features = false }
//! ```
//!
//! ## External tools
//!
//! | Stage | Default collaborator | Configure with |
//! |-------|----------------------|----------------|
//! | Render | pdfium shared library | `pdfium_library` |
//! | OCR | `tesseract` on `PATH` | `tesseract_bin`, `ocr_language` |
//! | Detect | `detect-diagrams` command + `best.pt` | `detector_program`, `model_weights` |
//! | LLM | edgequake-llm provider | `provider_name`, `model` |
//!
//! Every collaborator sits behind a trait, see [`Collaborators`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod stream;
pub mod workflow;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ResponseScope, SqlMode, WorkflowConfig, WorkflowConfigBuilder};
pub use error::{Exam2SqlError, SkipReason, SkippedFile};
pub use layout::WorkspaceLayout;
pub use manifest::RunManifest;
pub use pipeline::aggregate::AggregationScope;
pub use progress::{ChannelObserver, FanOut, Stage, StatusEvent, StatusLog, WorkflowObserver};
pub use session::{Session, SessionPhase};
pub use stream::{spawn_generate_sql, spawn_process, BackgroundAction, EventStream};
pub use workflow::{Collaborators, RunOutcome, SqlOutcome, Workflow};

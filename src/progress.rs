//! Status reporting: stage events flowing one way from the workflow to
//! whatever presents them.
//!
//! The workflow never talks to a terminal or a window directly. It calls a
//! [`WorkflowObserver`] as each stage starts, completes or fails, and the
//! presentation layer decides what to do with that. Three implementations
//! ship with the crate:
//!
//! * [`StatusLog`]: accumulates the human-readable log lines (the visible
//!   log of the two-button tool).
//! * [`ChannelObserver`]: forwards [`StatusEvent`]s over a Tokio channel so
//!   the action can run on another task.
//! * [`FanOut`]: delivers every event to several observers.
//!
//! # Example
//!
//! ```rust
//! use exam2sql::progress::{Stage, StatusLog, WorkflowObserver};
//!
//! let log = StatusLog::new();
//! log.on_stage_start(Stage::Rasterize);
//! log.on_stage_complete(Stage::Rasterize, "PDF converted into 2 images.");
//! assert_eq!(log.lines().len(), 2);
//! assert!(log.text().contains("✅ PDF converted into 2 images."));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// One discrete step of either user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Upload,
    Rasterize,
    Ocr,
    Detect,
    Merge,
    LlmProcess,
    Aggregate,
    GenerateSql,
}

impl Stage {
    /// Stages of the upload-and-process action, in execution order.
    pub const RUN: [Stage; 6] = [
        Stage::Upload,
        Stage::Rasterize,
        Stage::Ocr,
        Stage::Detect,
        Stage::Merge,
        Stage::LlmProcess,
    ];

    /// Stages of the generate-SQL action, in execution order.
    pub const SQL: [Stage; 2] = [Stage::Aggregate, Stage::GenerateSql];

    /// The "in progress" line shown when the stage starts.
    pub fn start_message(&self) -> &'static str {
        match self {
            Stage::Upload => "Uploading PDF...",
            Stage::Rasterize => "Converting PDF to images...",
            Stage::Ocr => "Running OCR on images...",
            Stage::Detect => "Running diagram detection...",
            Stage::Merge => "Merging extracted text and detected diagrams...",
            Stage::LlmProcess => "Processing each page with the LLM...",
            Stage::Aggregate => "Merging all response JSON files...",
            Stage::GenerateSql => "Generating SQL from merged JSON data...",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Upload => "upload",
            Stage::Rasterize => "PDF to image conversion",
            Stage::Ocr => "OCR processing",
            Stage::Detect => "diagram detection",
            Stage::Merge => "merging process",
            Stage::LlmProcess => "LLM processing",
            Stage::Aggregate => "response aggregation",
            Stage::GenerateSql => "SQL generation",
        };
        f.write_str(name)
    }
}

/// A status update, as carried over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    StageStarted(Stage),
    StageCompleted { stage: Stage, detail: String },
    StageFailed { stage: Stage, error: String },
    FileSkipped { file: String, reason: String },
    /// A block of output to display verbatim (LLM results, SQL text).
    Output(String),
    /// A warning or message not tied to a stage transition.
    Notice(String),
}

impl StatusEvent {
    /// Render the event as the log line the user sees.
    pub fn to_log_line(&self) -> String {
        match self {
            StatusEvent::StageStarted(stage) => format!("🔄 {}", stage.start_message()),
            StatusEvent::StageCompleted { detail, .. } => format!("✅ {detail}"),
            StatusEvent::StageFailed { stage, error } => {
                format!("❌ Error during {stage}: {error}")
            }
            StatusEvent::FileSkipped { file, reason } => {
                format!("❌ Error reading {file}: {reason}")
            }
            StatusEvent::Output(text) | StatusEvent::Notice(text) => text.clone(),
        }
    }

    /// Replay this event on an observer.
    pub fn dispatch(&self, observer: &dyn WorkflowObserver) {
        match self {
            StatusEvent::StageStarted(stage) => observer.on_stage_start(*stage),
            StatusEvent::StageCompleted { stage, detail } => {
                observer.on_stage_complete(*stage, detail)
            }
            StatusEvent::StageFailed { stage, error } => observer.on_stage_error(*stage, error),
            StatusEvent::FileSkipped { file, reason } => observer.on_file_skipped(file, reason),
            StatusEvent::Output(text) => observer.on_output(text),
            StatusEvent::Notice(message) => observer.on_notice(message),
        }
    }
}

/// Receives status updates from the workflow.
///
/// All methods default to no-ops so implementations only override what
/// they need. Implementations must be `Send + Sync`: the workflow may run
/// on a different task than the one that created the observer.
pub trait WorkflowObserver: Send + Sync {
    /// A stage is about to run.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// A stage finished; `detail` is the user-facing completion message.
    fn on_stage_complete(&self, stage: Stage, detail: &str) {
        let _ = (stage, detail);
    }

    /// A stage failed and the action was aborted.
    fn on_stage_error(&self, stage: Stage, error: &str) {
        let _ = (stage, error);
    }

    /// A response file was skipped during aggregation (non-fatal).
    fn on_file_skipped(&self, file: &str, reason: &str) {
        let _ = (file, reason);
    }

    /// A block of output to show the user.
    fn on_output(&self, text: &str) {
        let _ = text;
    }

    /// Emit a message that is not tied to a stage transition.
    fn on_notice(&self, message: &str) {
        self.on_output(message);
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl WorkflowObserver for NoopObserver {}

/// Accumulating, append-only status log.
#[derive(Debug, Default)]
pub struct StatusLog {
    lines: Mutex<Vec<String>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: StatusEvent) {
        let line = event.to_log_line();
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }

    /// Snapshot of the log lines so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// The whole log, one entry per line.
    pub fn text(&self) -> String {
        let mut text = self.lines().join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    /// True if any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl WorkflowObserver for StatusLog {
    fn on_stage_start(&self, stage: Stage) {
        self.push(StatusEvent::StageStarted(stage));
    }

    fn on_stage_complete(&self, stage: Stage, detail: &str) {
        self.push(StatusEvent::StageCompleted {
            stage,
            detail: detail.to_string(),
        });
    }

    fn on_stage_error(&self, stage: Stage, error: &str) {
        self.push(StatusEvent::StageFailed {
            stage,
            error: error.to_string(),
        });
    }

    fn on_file_skipped(&self, file: &str, reason: &str) {
        self.push(StatusEvent::FileSkipped {
            file: file.to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_output(&self, text: &str) {
        self.push(StatusEvent::Output(text.to_string()));
    }

    fn on_notice(&self, message: &str) {
        self.push(StatusEvent::Notice(message.to_string()));
    }
}

/// Observer that forwards every event over an unbounded channel.
///
/// Sending never blocks. Events sent after the receiver is dropped are
/// discarded.
pub struct ChannelObserver {
    tx: UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new(tx: UnboundedSender<StatusEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}

impl WorkflowObserver for ChannelObserver {
    fn on_stage_start(&self, stage: Stage) {
        self.send(StatusEvent::StageStarted(stage));
    }

    fn on_stage_complete(&self, stage: Stage, detail: &str) {
        self.send(StatusEvent::StageCompleted {
            stage,
            detail: detail.to_string(),
        });
    }

    fn on_stage_error(&self, stage: Stage, error: &str) {
        self.send(StatusEvent::StageFailed {
            stage,
            error: error.to_string(),
        });
    }

    fn on_file_skipped(&self, file: &str, reason: &str) {
        self.send(StatusEvent::FileSkipped {
            file: file.to_string(),
            reason: reason.to_string(),
        });
    }

    fn on_output(&self, text: &str) {
        self.send(StatusEvent::Output(text.to_string()));
    }

    fn on_notice(&self, message: &str) {
        self.send(StatusEvent::Notice(message.to_string()));
    }
}

/// Delivers each event to every wrapped observer, in order.
#[derive(Clone, Default)]
pub struct FanOut {
    observers: Vec<Arc<dyn WorkflowObserver>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl WorkflowObserver for FanOut {
    fn on_stage_start(&self, stage: Stage) {
        self.observers.iter().for_each(|o| o.on_stage_start(stage));
    }

    fn on_stage_complete(&self, stage: Stage, detail: &str) {
        self.observers
            .iter()
            .for_each(|o| o.on_stage_complete(stage, detail));
    }

    fn on_stage_error(&self, stage: Stage, error: &str) {
        self.observers
            .iter()
            .for_each(|o| o.on_stage_error(stage, error));
    }

    fn on_file_skipped(&self, file: &str, reason: &str) {
        self.observers
            .iter()
            .for_each(|o| o.on_file_skipped(file, reason));
    }

    fn on_output(&self, text: &str) {
        self.observers.iter().for_each(|o| o.on_output(text));
    }

    fn on_notice(&self, message: &str) {
        self.observers.iter().for_each(|o| o.on_notice(message));
    }
}

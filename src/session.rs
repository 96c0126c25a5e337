//! Interactive session state for the two-action tool.
//!
//! A [`Session`] owns what a window would otherwise keep in globals: the
//! status log, the current [`SessionPhase`], whether the SQL action is
//! available, and the manifest of the last successful run.
//!
//! ```text
//! Idle ──upload──▶ Processing ──ok──▶ AwaitingSql ──sql──▶ GeneratingSql ──ok──▶ Done
//!                      │                                        │
//!                      └──err──▶ RunFailed(stage)               └──err──▶ SqlFailed(stage)
//! ```
//!
//! The SQL action is refused until one run has succeeded. From then on it
//! stays available for the rest of the session, even after a later run fails.

use crate::config::ResponseScope;
use crate::error::Exam2SqlError;
use crate::manifest::RunManifest;
use crate::pipeline::aggregate::AggregationScope;
use crate::progress::{FanOut, Stage, StatusLog, WorkflowObserver};
use crate::workflow::{RunOutcome, SqlOutcome, Workflow};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Processing,
    AwaitingSql,
    RunFailed(Stage),
    GeneratingSql,
    Done,
    SqlFailed(Stage),
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => f.write_str("idle, upload a PDF to start processing"),
            SessionPhase::Processing => f.write_str("processing"),
            SessionPhase::AwaitingSql => f.write_str("ready to generate SQL"),
            SessionPhase::RunFailed(stage) => write!(f, "run failed during {stage}"),
            SessionPhase::GeneratingSql => f.write_str("generating SQL"),
            SessionPhase::Done => f.write_str("SQL generated"),
            SessionPhase::SqlFailed(stage) => write!(f, "SQL action failed during {stage}"),
        }
    }
}

pub struct Session {
    workflow: Workflow,
    log: Arc<StatusLog>,
    extra: Option<Arc<dyn WorkflowObserver>>,
    phase: SessionPhase,
    sql_enabled: bool,
    last_run: Option<RunManifest>,
}

impl Session {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            log: Arc::new(StatusLog::new()),
            extra: None,
            phase: SessionPhase::Idle,
            sql_enabled: false,
            last_run: None,
        }
    }

    /// Also deliver every status update to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.extra = Some(observer);
        self
    }

    pub fn log(&self) -> &StatusLog {
        &self.log
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the SQL action is available.
    pub fn sql_enabled(&self) -> bool {
        self.sql_enabled
    }

    /// Manifest of the last successful run.
    pub fn last_run(&self) -> Option<&RunManifest> {
        self.last_run.as_ref()
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    fn observer(&self) -> FanOut {
        let log: Arc<dyn WorkflowObserver> = self.log.clone();
        let fan = FanOut::new().with(log);
        match &self.extra {
            Some(extra) => fan.with(Arc::clone(extra)),
            None => fan,
        }
    }

    /// The upload-and-process action.
    ///
    /// No selection (or a blank one) is a no-op that returns `Ok(None)`
    /// without logging anything or changing state.
    pub async fn upload_and_process(
        &mut self,
        selection: Option<&str>,
    ) -> Result<Option<RunOutcome>, Exam2SqlError> {
        let Some(selection) = selection.map(str::trim).filter(|s| !s.is_empty()) else {
            debug!("No file selected; nothing to do");
            return Ok(None);
        };

        self.phase = SessionPhase::Processing;
        let observer = self.observer();
        match self.workflow.process_pdf(selection, &observer).await {
            Ok(outcome) => {
                self.phase = SessionPhase::AwaitingSql;
                self.sql_enabled = true;
                self.last_run = Some(outcome.manifest.clone());
                Ok(Some(outcome))
            }
            Err(e) => {
                self.phase = SessionPhase::RunFailed(e.stage().unwrap_or(Stage::Upload));
                Err(e)
            }
        }
    }

    /// The generate-SQL action.
    ///
    /// Uses the last successful run's files, or every response file when the
    /// workflow is configured for [`ResponseScope::AllResponses`].
    pub async fn generate_sql(&mut self) -> Result<SqlOutcome, Exam2SqlError> {
        if !self.sql_enabled {
            return Err(Exam2SqlError::SqlNotReady);
        }

        let scope = match (self.workflow.config().response_scope, &self.last_run) {
            (ResponseScope::CurrentRun, Some(manifest)) => AggregationScope::Run(manifest.clone()),
            _ => AggregationScope::AllResponses,
        };

        self.phase = SessionPhase::GeneratingSql;
        let observer = self.observer();
        match self.workflow.generate_sql(scope, &observer).await {
            Ok(outcome) => {
                self.phase = SessionPhase::Done;
                Ok(outcome)
            }
            Err(e) => {
                self.phase = SessionPhase::SqlFailed(e.stage().unwrap_or(Stage::Aggregate));
                Err(e)
            }
        }
    }
}

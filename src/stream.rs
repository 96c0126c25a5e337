//! Background actions: run a workflow action on its own task and stream its
//! status events.
//!
//! ## Why stream?
//!
//! A run takes minutes (rasterisation, OCR and one model call per page). The
//! presentation layer must stay responsive meanwhile, so it never runs a
//! stage itself. Instead it spawns the action with [`spawn_process`] or
//! [`spawn_generate_sql`], renders [`StatusEvent`]s from the returned
//! [`EventStream`] as they arrive, and awaits the [`JoinHandle`] for the
//! final result.
//!
//! The stream ends when the action finishes, successfully or not.

use crate::error::Exam2SqlError;
use crate::pipeline::aggregate::AggregationScope;
use crate::progress::{ChannelObserver, StatusEvent};
use crate::workflow::{RunOutcome, SqlOutcome, Workflow};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of status events.
pub type EventStream = Pin<Box<dyn Stream<Item = StatusEvent> + Send>>;

/// A running action: its events, and its result once it ends.
pub struct BackgroundAction<T> {
    pub events: EventStream,
    pub handle: JoinHandle<Result<T, Exam2SqlError>>,
}

impl<T> BackgroundAction<T> {
    /// Wait for the result, flattening a panicked task into an error.
    pub async fn join(self) -> Result<T, Exam2SqlError> {
        self.handle
            .await
            .map_err(|e| Exam2SqlError::Internal(format!("Action task failed: {}", e)))?
    }
}

/// Run [`Workflow::process_pdf`] on a new Tokio task.
///
/// # Example
/// ```rust,no_run
/// use exam2sql::{stream::spawn_process, Workflow, WorkflowConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = Workflow::new(WorkflowConfig::default())?;
/// let mut action = spawn_process(workflow, "exam.pdf");
/// while let Some(event) = action.events.next().await {
///     println!("{}", event.to_log_line());
/// }
/// let outcome = action.join().await?;
/// println!("{} pages", outcome.page_images.len());
/// # Ok(())
/// # }
/// ```
pub fn spawn_process(
    workflow: Workflow,
    selection: impl Into<String>,
) -> BackgroundAction<RunOutcome> {
    let selection = selection.into();
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        info!("Background run started for {}", selection);
        let observer = ChannelObserver::new(tx);
        workflow.process_pdf(&selection, &observer).await
    });

    BackgroundAction {
        events: Box::pin(UnboundedReceiverStream::new(rx)),
        handle,
    }
}

/// Run [`Workflow::generate_sql`] on a new Tokio task.
pub fn spawn_generate_sql(
    workflow: Workflow,
    scope: AggregationScope,
) -> BackgroundAction<SqlOutcome> {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let observer = ChannelObserver::new(tx);
        workflow.generate_sql(scope, &observer).await
    });

    BackgroundAction {
        events: Box::pin(UnboundedReceiverStream::new(rx)),
        handle,
    }
}

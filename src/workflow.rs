//! Orchestration of the two user actions.
//!
//! [`Workflow::process_pdf`] runs upload → rasterise → OCR → detect → merge
//! → LLM; [`Workflow::generate_sql`] runs aggregate → SQL. Stages run
//! strictly in order. The first failure is reported to the observer and
//! ends the action; nothing is retried.

use crate::config::WorkflowConfig;
use crate::error::Exam2SqlError;
use crate::layout::WorkspaceLayout;
use crate::manifest::RunManifest;
use crate::pipeline::aggregate::{aggregate_responses, AggregationScope};
use crate::pipeline::detect::{finalize_predictions, CommandDetector, DiagramDetector};
use crate::pipeline::intake::{self, Upload};
use crate::pipeline::llm::{process_pages, EdgequakeModel, LanguageModel, PageResponse};
use crate::pipeline::merge::{merge_page_data, DiagramInfo};
use crate::pipeline::ocr::{run_ocr, OcrEngine, TesseractOcr};
use crate::pipeline::render::{PdfiumRasterizer, Rasterizer};
use crate::pipeline::sql::{generator_for, SqlGenerator};
use crate::progress::{Stage, WorkflowObserver};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Line shown when aggregation finds nothing to merge.
pub const NO_DATA_MESSAGE: &str = "❌ No valid JSON data found. SQL generation aborted.";

/// The external capabilities the workflow calls.
#[derive(Clone)]
pub struct Collaborators {
    pub rasterizer: Arc<dyn Rasterizer>,
    pub ocr: Arc<dyn OcrEngine>,
    pub detector: Arc<dyn DiagramDetector>,
    pub model: Arc<dyn LanguageModel>,
    pub sql: Arc<dyn SqlGenerator>,
}

impl Collaborators {
    /// Production collaborators: pdfium, tesseract, the detector command,
    /// an edgequake-llm provider and the configured SQL generator.
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let model: Arc<dyn LanguageModel> = Arc::new(EdgequakeModel::from_config(config));
        Self {
            rasterizer: Arc::new(PdfiumRasterizer::from_config(config)),
            ocr: Arc::new(TesseractOcr::from_config(config)),
            detector: Arc::new(CommandDetector::from_config(config)),
            sql: generator_for(config, Arc::clone(&model)),
            model,
        }
    }
}

/// Result of a successful upload-and-process action.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub upload: Upload,
    pub page_images: Vec<PathBuf>,
    pub ocr_files: Vec<PathBuf>,
    pub diagram_info: DiagramInfo,
    pub responses: Vec<PageResponse>,
    pub manifest: RunManifest,
}

impl RunOutcome {
    /// All page records, in page order.
    pub fn records(&self) -> Vec<Value> {
        self.responses
            .iter()
            .flat_map(|r| r.records.iter().cloned())
            .collect()
    }
}

/// Result of a successful generate-SQL action.
#[derive(Debug, Clone)]
pub struct SqlOutcome {
    pub merged_path: PathBuf,
    pub record_count: usize,
    pub skipped: usize,
    pub sql_path: PathBuf,
    pub sql: String,
}

/// Runs the stages against one workspace.
#[derive(Clone)]
pub struct Workflow {
    config: WorkflowConfig,
    layout: WorkspaceLayout,
    collaborators: Collaborators,
}

impl Workflow {
    /// Workflow with production collaborators. Creates the workspace
    /// directories.
    pub fn new(config: WorkflowConfig) -> Result<Self, Exam2SqlError> {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(
        config: WorkflowConfig,
        collaborators: Collaborators,
    ) -> Result<Self, Exam2SqlError> {
        let layout = WorkspaceLayout::new(&config.workspace_root);
        layout.ensure()?;
        Ok(Self {
            config,
            layout,
            collaborators,
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Upload `selection` and run it through LLM processing.
    ///
    /// On success the run manifest is saved and the page records are
    /// emitted as pretty JSON output.
    pub async fn process_pdf(
        &self,
        selection: &str,
        observer: &dyn WorkflowObserver,
    ) -> Result<RunOutcome, Exam2SqlError> {
        let c = &self.collaborators;
        let layout = &self.layout;

        // ── Upload ───────────────────────────────────────────────────────
        let upload = run_stage(
            Stage::Upload,
            observer,
            intake::upload(
                selection,
                &layout.uploads,
                self.config.download_timeout_secs,
            ),
        )
        .await?;
        observer.on_stage_complete(Stage::Upload, "PDF uploaded successfully.");
        info!("Run {} started for {}", upload.run_id, upload.source);

        // ── Rasterise ────────────────────────────────────────────────────
        let page_images = run_stage(
            Stage::Rasterize,
            observer,
            c.rasterizer.rasterize(&upload.path, &layout.page_images),
        )
        .await?;
        if page_images.is_empty() {
            let err = Exam2SqlError::NoPagesRendered {
                path: upload.path.clone(),
            };
            return Err(fail(Stage::Rasterize, observer, err));
        }
        observer.on_stage_complete(
            Stage::Rasterize,
            &format!("PDF converted into {} images.", page_images.len()),
        );

        // ── OCR ──────────────────────────────────────────────────────────
        let ocr_files = run_stage(
            Stage::Ocr,
            observer,
            run_ocr(c.ocr.as_ref(), &page_images, &layout.ocr_text),
        )
        .await?;
        observer.on_stage_complete(Stage::Ocr, "OCR processing completed.");

        // ── Detect ───────────────────────────────────────────────────────
        let predictions = run_stage(Stage::Detect, observer, async {
            let raw = c
                .detector
                .detect(
                    &page_images,
                    &self.config.model_weights,
                    &layout.output_with_boxes,
                )
                .await?;
            finalize_predictions(
                raw,
                &page_images,
                self.config.confidence_threshold,
                &layout.predictions(),
                &layout.output_with_boxes,
            )
            .await
        })
        .await?;
        observer.on_stage_complete(
            Stage::Detect,
            &format!(
                "Diagram detection completed ({} diagrams found).",
                predictions.detection_count()
            ),
        );

        // ── Merge ────────────────────────────────────────────────────────
        let diagram_info = run_stage(
            Stage::Merge,
            observer,
            merge_page_data(
                &upload.run_id,
                &predictions,
                &layout.ocr_text,
                &layout.cropped_diagrams,
                &layout.diagram_info(),
            ),
        )
        .await?;
        for page in diagram_info.pages.iter().filter(|p| p.ocr_missing) {
            observer.on_notice(&format!(
                "⚠️ No OCR text for {}; continuing with empty text.",
                page.page
            ));
        }
        observer.on_stage_complete(Stage::Merge, "Text and diagrams merged successfully.");

        // ── LLM ──────────────────────────────────────────────────────────
        let responses = run_stage(
            Stage::LlmProcess,
            observer,
            process_pages(c.model.as_ref(), &diagram_info, layout, &self.config),
        )
        .await?;

        let manifest = RunManifest {
            run_id: upload.run_id.clone(),
            source: upload.source.clone(),
            upload: upload.path.clone(),
            page_count: page_images.len(),
            response_files: responses.iter().map(|r| r.path.clone()).collect(),
            created_at: Utc::now(),
        };
        manifest
            .save(layout)
            .map_err(|e| fail(Stage::LlmProcess, observer, e))?;
        observer.on_stage_complete(Stage::LlmProcess, "LLM processing completed.");

        let outcome = RunOutcome {
            upload,
            page_images,
            ocr_files,
            diagram_info,
            responses,
            manifest,
        };
        match serde_json::to_string_pretty(&outcome.records()) {
            Ok(json) => observer.on_output(&json),
            Err(e) => warn!("Could not render results for display: {}", e),
        }
        Ok(outcome)
    }

    /// Aggregate the response files in `scope` and generate SQL.
    ///
    /// The SQL file is read back and emitted as output.
    pub async fn generate_sql(
        &self,
        scope: AggregationScope,
        observer: &dyn WorkflowObserver,
    ) -> Result<SqlOutcome, Exam2SqlError> {
        let layout = &self.layout;

        // ── Aggregate ────────────────────────────────────────────────────
        observer.on_stage_start(Stage::Aggregate);
        let aggregation = match aggregate_responses(&layout.responses, &scope, |skip| {
            let name = skip
                .file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| skip.file.display().to_string());
            observer.on_file_skipped(&name, &skip.reason.to_string());
        }) {
            Ok(a) => a,
            Err(e @ Exam2SqlError::NoResponseData { .. }) => {
                observer.on_notice(NO_DATA_MESSAGE);
                return Err(e.in_stage(Stage::Aggregate));
            }
            Err(e) => return Err(fail(Stage::Aggregate, observer, e)),
        };
        observer.on_stage_complete(
            Stage::Aggregate,
            &format!("Merged JSON saved at {}", aggregation.merged_path.display()),
        );

        // ── Generate SQL ─────────────────────────────────────────────────
        let label = &self.config.sql_label;
        let (sql_path, sql) = run_stage(Stage::GenerateSql, observer, async {
            let path = self
                .collaborators
                .sql
                .generate(&aggregation.merged_path, label, &layout.sql_outputs)
                .await?;
            let sql = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Exam2SqlError::io(&path, e))?;
            Ok::<_, Exam2SqlError>((path, sql))
        })
        .await?;
        observer.on_stage_complete(
            Stage::GenerateSql,
            "SQL generation completed. Here is the output:",
        );
        observer.on_output(&sql);

        Ok(SqlOutcome {
            merged_path: aggregation.merged_path,
            record_count: aggregation.records.len(),
            skipped: aggregation.skipped.len(),
            sql_path,
            sql,
        })
    }
}

/// Announce `stage`, await it, and report a failure.
async fn run_stage<T>(
    stage: Stage,
    observer: &dyn WorkflowObserver,
    work: impl Future<Output = Result<T, Exam2SqlError>>,
) -> Result<T, Exam2SqlError> {
    observer.on_stage_start(stage);
    work.await.map_err(|e| fail(stage, observer, e))
}

fn fail(stage: Stage, observer: &dyn WorkflowObserver, err: Exam2SqlError) -> Exam2SqlError {
    warn!("{} failed: {}", stage, err);
    observer.on_stage_error(stage, &err.root().to_string());
    err.in_stage(stage)
}

//! Workflow integration tests.
//!
//! The external collaborators (pdfium, tesseract, the detector and the LLM)
//! are replaced by in-process fakes so these run anywhere. The last test
//! drives the real collaborators and is gated behind `E2E_ENABLED`.
//!
//! Run the live test with:
//!   E2E_ENABLED=1 cargo test --test workflow -- --nocapture

use async_trait::async_trait;
use exam2sql::pipeline::detect::{
    BoundingBox, Detection, DiagramDetector, PagePredictions, PredictionSet,
};
use exam2sql::pipeline::llm::{LanguageModel, ModelReply, ModelRequest};
use exam2sql::pipeline::ocr::{OcrEngine, OcrPage};
use exam2sql::pipeline::render::{page_image_name, Rasterizer};
use exam2sql::pipeline::sql::{SqlGenerator, TemplateSqlGenerator};
use exam2sql::workflow::NO_DATA_MESSAGE;
use exam2sql::{
    spawn_process, AggregationScope, Collaborators, Exam2SqlError, Session, SessionPhase, Stage,
    StatusEvent, StatusLog, Workflow, WorkflowConfig,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Writes `pages` blank 200×100 PNGs.
struct BlankPages {
    pages: usize,
}

#[async_trait]
impl Rasterizer for BlankPages {
    async fn rasterize(&self, _pdf: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, Exam2SqlError> {
        std::fs::create_dir_all(out_dir).map_err(|e| Exam2SqlError::io(out_dir, e))?;
        let mut paths = Vec::new();
        for n in 1..=self.pages {
            let path = out_dir.join(page_image_name(n));
            image::RgbaImage::from_pixel(200, 100, image::Rgba([255, 255, 255, 255]))
                .save(&path)
                .map_err(|e| Exam2SqlError::ImageFailed {
                    path: path.clone(),
                    detail: e.to_string(),
                })?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Returns "text of <stem>" for every page.
struct EchoOcr;

#[async_trait]
impl OcrEngine for EchoOcr {
    async fn recognize(&self, image: &Path) -> Result<OcrPage, Exam2SqlError> {
        let stem = image.file_stem().unwrap().to_string_lossy().into_owned();
        Ok(OcrPage {
            text: format!("text of {stem}"),
            words: Vec::new(),
        })
    }
}

/// One diagram on the first page, nothing elsewhere.
struct OneDiagram;

#[async_trait]
impl DiagramDetector for OneDiagram {
    async fn detect(
        &self,
        images: &[PathBuf],
        _weights: &Path,
        _out_dir: &Path,
    ) -> Result<PredictionSet, Exam2SqlError> {
        let pages = images
            .iter()
            .enumerate()
            .map(|(i, image)| PagePredictions {
                image: image.clone(),
                width: Some(200),
                height: Some(100),
                detections: if i == 0 {
                    vec![Detection {
                        label: "diagram".into(),
                        confidence: 0.9,
                        bbox: BoundingBox {
                            x1: 10.0,
                            y1: 10.0,
                            x2: 60.0,
                            y2: 50.0,
                        },
                    }]
                } else {
                    Vec::new()
                },
            })
            .collect();
        Ok(PredictionSet { pages })
    }
}

/// Answers one question per page; fails on `fail_on_page` if set.
struct PageModel {
    fail_on_page: Option<usize>,
}

#[async_trait]
impl LanguageModel for PageModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply, Exam2SqlError> {
        let page = (1..=50)
            .find(|n| request.user.starts_with(&format!("Page {n} ")))
            .unwrap_or(0);
        if self.fail_on_page == Some(page) {
            return Err(Exam2SqlError::LlmApiError {
                message: "503 Service Unavailable".into(),
            });
        }
        Ok(ModelReply {
            content: format!(
                "```json\n[{{\"question_number\": {page}, \"question_text\": \"Question on page {page}\"}}]\n```"
            ),
            ..Default::default()
        })
    }
}

/// Tesseract exits non-zero on every page.
struct BrokenOcr;

#[async_trait]
impl OcrEngine for BrokenOcr {
    async fn recognize(&self, image: &Path) -> Result<OcrPage, Exam2SqlError> {
        Err(Exam2SqlError::OcrFailed {
            image: image.to_path_buf(),
            detail: "tesseract exited with status 1".into(),
        })
    }
}

/// The detector cannot load its weights.
struct BrokenDetector;

#[async_trait]
impl DiagramDetector for BrokenDetector {
    async fn detect(
        &self,
        _images: &[PathBuf],
        _weights: &Path,
        _out_dir: &Path,
    ) -> Result<PredictionSet, Exam2SqlError> {
        Err(Exam2SqlError::DetectionFailed {
            detail: "weights not found".into(),
        })
    }
}

/// SQL generation always fails.
struct BrokenSql;

#[async_trait]
impl SqlGenerator for BrokenSql {
    async fn generate(
        &self,
        _merged: &Path,
        _label: &str,
        _sql_dir: &Path,
    ) -> Result<PathBuf, Exam2SqlError> {
        Err(Exam2SqlError::SqlGenerationFailed {
            detail: "model returned no SQL".into(),
        })
    }
}

fn collaborators(pages: usize, fail_on_page: Option<usize>) -> Collaborators {
    Collaborators {
        rasterizer: Arc::new(BlankPages { pages }),
        ocr: Arc::new(EchoOcr),
        detector: Arc::new(OneDiagram),
        model: Arc::new(PageModel { fail_on_page }),
        sql: Arc::new(TemplateSqlGenerator::new("questions", true)),
    }
}

fn workflow(root: &Path, pages: usize, fail_on_page: Option<usize>) -> Workflow {
    workflow_with(root, collaborators(pages, fail_on_page))
}

fn workflow_with(root: &Path, collabs: Collaborators) -> Workflow {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = WorkflowConfig::builder()
        .workspace_root(root)
        .build()
        .unwrap();
    Workflow::with_collaborators(config, collabs).unwrap()
}

fn sample_pdf(dir: &Path) -> PathBuf {
    let path = dir.join("exam.pdf");
    std::fs::write(&path, b"%PDF-1.4\n%fake\n").unwrap();
    path
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ── Session scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn two_page_run_then_sql() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut session = Session::new(workflow(ws.path(), 2, None));

    assert!(!session.sql_enabled());
    let run = session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap()
        .unwrap();

    let layout = session.workflow().layout().clone();
    assert_eq!(run.page_images.len(), 2);
    assert_eq!(
        file_names(&layout.page_images),
        ["page_1.png", "page_2.png"]
    );
    assert_eq!(file_names(&layout.ocr_text), ["page_1.txt", "page_2.txt"]);
    assert_eq!(
        std::fs::read_to_string(layout.ocr_text.join("page_2.txt")).unwrap(),
        "text of page_2"
    );
    assert_eq!(
        file_names(&layout.cropped_diagrams),
        ["page_1_diagram_1.png"]
    );
    assert!(layout.output_with_boxes.join("page_1_boxed.png").exists());

    let info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(layout.diagram_info()).unwrap()).unwrap();
    assert_eq!(info["pages"].as_array().unwrap().len(), 2);
    assert_eq!(info["pages"][0]["diagrams"].as_array().unwrap().len(), 1);

    assert_eq!(run.records().len(), 2);
    assert_eq!(run.records()[1]["page"], 2);
    assert_eq!(session.phase(), SessionPhase::AwaitingSql);
    assert!(session.sql_enabled());
    assert!(session.log().contains("✅ PDF converted into 2 images."));
    assert!(session.log().contains("✅ LLM processing completed."));
    assert!(session.log().contains("Question on page 1"));

    let sql = session.generate_sql().await.unwrap();
    assert_eq!(sql.record_count, 2);
    assert_eq!(
        sql.sql_path,
        layout.sql_outputs.join("exam_2024.pdf_output.sql")
    );
    assert!(sql.sql.contains("CREATE TABLE IF NOT EXISTS"));
    assert_eq!(sql.sql.matches("INSERT INTO").count(), 2);
    assert_eq!(session.phase(), SessionPhase::Done);
    assert!(session
        .log()
        .contains("✅ SQL generation completed. Here is the output:"));
}

#[tokio::test]
async fn llm_failure_keeps_earlier_pages() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut session = Session::new(workflow(ws.path(), 3, Some(2)));

    let err = session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::LlmProcess));
    assert!(matches!(err.root(), Exam2SqlError::LlmApiError { .. }));
    assert_eq!(session.phase(), SessionPhase::RunFailed(Stage::LlmProcess));
    assert!(!session.sql_enabled());
    assert!(session
        .log()
        .contains("❌ Error during LLM processing: LLM API error: 503 Service Unavailable"));

    // Page 1 was answered before the failure; its file stays.
    let layout = session.workflow().layout();
    let responses = file_names(&layout.responses);
    assert_eq!(responses.len(), 1);
    assert!(responses[0].ends_with("_page_1.json"));
    assert!(file_names(&layout.runs).is_empty());
}

#[tokio::test]
async fn sql_stays_enabled_after_later_failure() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut session = Session::new(workflow(ws.path(), 1, None));

    session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap();
    let first_run = session.last_run().unwrap().run_id.clone();

    let err = session
        .upload_and_process(Some("/no/such/exam.pdf"))
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Upload));
    assert!(session.sql_enabled());
    assert_eq!(session.last_run().unwrap().run_id, first_run);

    let sql = session.generate_sql().await.unwrap();
    assert_eq!(sql.record_count, 1);
}

// ── Stage failures ───────────────────────────────────────────────────────────

/// Run one upload against `session` and check it stopped at `stage`: the
/// error is logged, no later stage started and SQL stays disabled.
async fn assert_run_stops_at(session: &mut Session, pdf: &Path, stage: Stage, error: &str) {
    let err = session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(stage));
    assert_eq!(session.phase(), SessionPhase::RunFailed(stage));
    assert!(!session.sql_enabled());
    assert!(session.last_run().is_none());

    let log = session.log();
    assert!(log.contains(&format!("❌ Error during {stage}: {error}")));
    let failed_at = Stage::RUN.iter().position(|s| *s == stage).unwrap();
    for later in &Stage::RUN[failed_at + 1..] {
        assert!(
            !log.contains(later.start_message()),
            "{later} started after {stage} failed"
        );
    }
}

#[tokio::test]
async fn zero_page_pdf_stops_at_rasterize() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut session = Session::new(workflow(ws.path(), 0, None));

    assert_run_stops_at(
        &mut session,
        &pdf,
        Stage::Rasterize,
        "No images generated from the PDF",
    )
    .await;
    let layout = session.workflow().layout();
    assert!(file_names(&layout.ocr_text).is_empty());
}

#[tokio::test]
async fn ocr_failure_stops_the_run() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut collabs = collaborators(1, None);
    collabs.ocr = Arc::new(BrokenOcr);
    let mut session = Session::new(workflow_with(ws.path(), collabs));

    assert_run_stops_at(&mut session, &pdf, Stage::Ocr, "OCR failed").await;
    assert!(session.log().contains("tesseract exited with status 1"));
}

#[tokio::test]
async fn detector_failure_stops_the_run() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut collabs = collaborators(1, None);
    collabs.detector = Arc::new(BrokenDetector);
    let mut session = Session::new(workflow_with(ws.path(), collabs));

    assert_run_stops_at(
        &mut session,
        &pdf,
        Stage::Detect,
        "Diagram detection failed",
    )
    .await;
    assert!(session.log().contains("weights not found"));
    assert!(!session.workflow().layout().diagram_info().exists());
}

#[tokio::test]
async fn merge_failure_stops_the_run() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut session = Session::new(workflow(ws.path(), 1, None));

    // A directory where the diagram-info document goes cannot be written.
    std::fs::create_dir_all(session.workflow().layout().diagram_info()).unwrap();

    let err = session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Merge));
    assert!(matches!(err.root(), Exam2SqlError::Io { .. }));
    assert_eq!(session.phase(), SessionPhase::RunFailed(Stage::Merge));
    assert!(!session.sql_enabled());
    assert!(session.log().contains("❌ Error during merging process: "));
    assert!(!session.log().contains(Stage::LlmProcess.start_message()));
    let layout = session.workflow().layout();
    assert!(file_names(&layout.responses).is_empty());
}

#[tokio::test]
async fn sql_generator_failure_is_reported() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let mut collabs = collaborators(1, None);
    collabs.sql = Arc::new(BrokenSql);
    let mut session = Session::new(workflow_with(ws.path(), collabs));

    session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap();
    let err = session.generate_sql().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::GenerateSql));
    assert!(matches!(
        err.root(),
        Exam2SqlError::SqlGenerationFailed { .. }
    ));
    assert_eq!(session.phase(), SessionPhase::SqlFailed(Stage::GenerateSql));
    assert!(session.sql_enabled());
    assert!(session
        .log()
        .contains("❌ Error during SQL generation: SQL generation failed: model returned no SQL"));
    let layout = session.workflow().layout();
    assert!(file_names(&layout.sql_outputs).is_empty());
}

// ── Aggregation and SQL ──────────────────────────────────────────────────────

#[tokio::test]
async fn non_list_response_is_skipped() {
    let ws = tempfile::tempdir().unwrap();
    let wf = workflow(ws.path(), 1, None);
    let responses = &wf.layout().responses;
    std::fs::write(responses.join("a.json"), r#"[{"q": 1}]"#).unwrap();
    std::fs::write(responses.join("b.json"), r#"{"x": 1}"#).unwrap();

    let log = StatusLog::new();
    let out = wf
        .generate_sql(AggregationScope::AllResponses, &log)
        .await
        .unwrap();

    assert_eq!(out.record_count, 1);
    assert_eq!(out.skipped, 1);
    assert!(log.contains("❌ Error reading b.json"));
    let merged: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out.merged_path).unwrap()).unwrap();
    assert_eq!(merged, serde_json::json!([{"q": 1}]));
}

#[tokio::test]
async fn regeneration_is_byte_identical() {
    let ws = tempfile::tempdir().unwrap();
    let wf = workflow(ws.path(), 1, None);
    let responses = &wf.layout().responses;
    std::fs::write(
        responses.join("r1_page_1.json"),
        r#"[{"question_number": 1, "answer": "B", "marks": 2}]"#,
    )
    .unwrap();
    std::fs::write(
        responses.join("r1_page_2.json"),
        r#"[{"question_number": 2, "answer": null, "options": ["a", "b"]}]"#,
    )
    .unwrap();

    let log = StatusLog::new();
    let first = wf
        .generate_sql(AggregationScope::AllResponses, &log)
        .await
        .unwrap();
    let bytes = std::fs::read(&first.sql_path).unwrap();
    let second = wf
        .generate_sql(AggregationScope::AllResponses, &log)
        .await
        .unwrap();

    assert_eq!(first.sql, second.sql);
    assert_eq!(bytes, std::fs::read(&second.sql_path).unwrap());
}

#[tokio::test]
async fn empty_responses_write_no_sql() {
    let ws = tempfile::tempdir().unwrap();
    let wf = workflow(ws.path(), 1, None);

    let log = StatusLog::new();
    let err = wf
        .generate_sql(AggregationScope::AllResponses, &log)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Aggregate));
    assert!(log.contains(NO_DATA_MESSAGE));
    assert!(file_names(&wf.layout().sql_outputs).is_empty());
    assert!(!wf.layout().merged_responses().exists());
}

// ── Background stream ────────────────────────────────────────────────────────

#[tokio::test]
async fn background_run_streams_stage_events_in_order() {
    let ws = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let pdf = sample_pdf(src.path());
    let wf = workflow(ws.path(), 2, None);

    let mut action = spawn_process(wf, pdf.to_string_lossy());
    let mut events = Vec::new();
    while let Some(event) = action.events.next().await {
        events.push(event);
    }
    let outcome = action.join().await.unwrap();
    assert_eq!(outcome.page_images.len(), 2);

    let started: Vec<Stage> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::StageStarted(stage) => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(started, Stage::RUN);
    assert!(matches!(events.last(), Some(StatusEvent::Output(_))));
    assert!(!events
        .iter()
        .any(|e| matches!(e, StatusEvent::StageFailed { .. })));
}

// ── Live run ─────────────────────────────────────────────────────────────────

/// Skip unless E2E_ENABLED is set and the sample paper exists.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

#[tokio::test]
async fn e2e_sample_paper() {
    let pdf = e2e_skip_unless_ready!(
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases/exam.pdf")
    );
    let ws = tempfile::tempdir().unwrap();
    let config = WorkflowConfig::builder()
        .workspace_root(ws.path())
        .build()
        .unwrap();
    let mut session = Session::new(Workflow::new(config).unwrap());

    let run = session
        .upload_and_process(Some(pdf.to_str().unwrap()))
        .await
        .unwrap()
        .unwrap();
    println!(
        "{} pages, {} records",
        run.page_images.len(),
        run.records().len()
    );

    let sql = session.generate_sql().await.unwrap();
    println!("{}", sql.sql);
    assert!(sql.sql.starts_with("-- SQL generated from"));
    print!("{}", session.log().text());
}

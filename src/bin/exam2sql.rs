//! CLI binary for exam2sql.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `WorkflowConfig`, runs actions on background tasks and renders their
//! status events in the terminal.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use exam2sql::{
    spawn_generate_sql, spawn_process, AggregationScope, BackgroundAction, Exam2SqlError,
    ResponseScope, RunManifest, Session, SqlMode, Stage, Workflow, WorkflowConfig,
    WorkflowObserver,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── Terminal observer using indicatif ────────────────────────────────────────

/// Renders status events: a spinner naming the running stage, with one log
/// line per event printed above it. Output blocks (results JSON, SQL) go to
/// stdout; everything else to stderr.
struct CliObserver {
    /// `None` when progress display is disabled.
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl CliObserver {
    fn new(show_progress: bool, quiet: bool) -> Arc<Self> {
        let bar = show_progress.then(|| {
            let bar = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
            bar.set_style(style);
            bar.set_prefix("exam2sql");
            bar.set_message("Waiting…");
            bar
        });
        Arc::new(Self { bar, quiet })
    }

    fn line(&self, text: String) {
        if self.quiet {
            return;
        }
        match &self.bar {
            Some(bar) => bar.println(text),
            None => eprintln!("{text}"),
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl WorkflowObserver for CliObserver {
    fn on_stage_start(&self, stage: Stage) {
        if let Some(bar) = &self.bar {
            bar.enable_steady_tick(Duration::from_millis(80));
            bar.reset();
            bar.set_message(stage.start_message());
        }
        self.line(format!("{} {}", cyan("🔄"), stage.start_message()));
    }

    fn on_stage_complete(&self, _stage: Stage, detail: &str) {
        self.line(format!("{} {}", green("✅"), detail));
    }

    fn on_stage_error(&self, stage: Stage, error: &str) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
        }
        // Errors are shown even in quiet mode.
        let text = red(&format!("❌ Error during {stage}: {error}"));
        match &self.bar {
            Some(bar) => bar.println(text),
            None => eprintln!("{text}"),
        }
    }

    fn on_file_skipped(&self, file: &str, reason: &str) {
        self.line(red(&format!("❌ Error reading {file}: {reason}")));
    }

    fn on_output(&self, text: &str) {
        match &self.bar {
            Some(bar) => bar.suspend(|| println!("{text}")),
            None => println!("{text}"),
        }
    }

    fn on_notice(&self, message: &str) {
        self.line(message.to_string());
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process an exam paper, then generate SQL from this run's responses
  exam2sql process exam.pdf --generate-sql

  # Process a PDF from a URL
  exam2sql process https://example.org/papers/2024-physics.pdf

  # Generate SQL from the last run, a specific run, or every response file
  exam2sql generate-sql
  exam2sql generate-sql --run 3f2a9c0d5b7e4f1a8c6d2e0b9a7f5c3d
  exam2sql generate-sql --all

  # Interactive session (upload / sql / log / status / quit)
  exam2sql interactive

  # Let the model write the SQL instead of the built-in template
  exam2sql --sql-mode llm generate-sql

WORKSPACE LAYOUT:
  uploads/                     <token>.pdf
  responses/                   <run>_page_<n>.json, merged_data.json
  runs/                        <run>.json
  static/page_images/          page_<n>.png
  static/ocr_text/             page_<n>.txt
  static/output_with_boxes/    predictions.json, page_<n>_boxed.png
  static/cropped_diagrams/     page_<n>_diagram_<k>.png
  sql_outputs/                 <label>_output.sql
  diagram_info.json

EXTERNAL TOOLS:
  tesseract        OCR engine (must be on PATH or set --tesseract)
  detect-diagrams  Diagram detector, called as
                   <program> [args] --weights <w> --output-dir <dir> <image>...
                   and expected to print predictions JSON on stdout
  libpdfium        PDF renderer (system library or --pdfium-lib)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium
"#;

/// Turn exam PDFs into SQL insert statements.
#[derive(Parser, Debug)]
#[command(
    name = "exam2sql",
    version,
    about = "Turn exam PDFs into SQL insert statements",
    long_about = "Rasterise an exam PDF, OCR every page, detect diagrams, extract question \
records page by page with an LLM, then merge the records and generate SQL.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a PDF (path or URL) and run it through LLM processing.
    Process {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,

        /// Generate SQL from this run's responses when processing succeeds.
        #[arg(long)]
        generate_sql: bool,
    },

    /// Merge response files and generate SQL.
    GenerateSql {
        /// Only the responses of this run id.
        #[arg(long, conflicts_with = "all")]
        run: Option<String>,

        /// Every response file in the workspace.
        #[arg(long)]
        all: bool,
    },

    /// Interactive session: upload <path> | sql | log | status | help | quit.
    Interactive,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Workspace root holding uploads/, responses/, static/ and sql_outputs/.
    #[arg(
        short,
        long,
        global = true,
        env = "EXAM2SQL_WORKSPACE",
        default_value = "."
    )]
    workspace: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Tesseract language code(s), e.g. eng or eng+hin.
    #[arg(long, global = true, env = "EXAM2SQL_OCR_LANG", default_value = "eng")]
    ocr_lang: String,

    /// Tesseract executable.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_TESSERACT",
        default_value = "tesseract"
    )]
    tesseract: String,

    /// Diagram detector executable.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_DETECTOR",
        default_value = "detect-diagrams"
    )]
    detector: String,

    /// Extra argument passed to the detector (repeatable).
    #[arg(long = "detector-arg", global = true, allow_hyphen_values = true)]
    detector_args: Vec<String>,

    /// Detector model weights.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_WEIGHTS",
        default_value = "best.pt"
    )]
    weights: PathBuf,

    /// Minimum detection confidence (0.0–1.0).
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_CONFIDENCE",
        default_value_t = 0.25
    )]
    confidence: f32,

    /// Label used in the SQL file name: <label>_output.sql.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_SQL_LABEL",
        default_value = exam2sql::config::DEFAULT_SQL_LABEL
    )]
    sql_label: String,

    /// How SQL is produced.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_SQL_MODE",
        value_enum,
        default_value = "template"
    )]
    sql_mode: SqlModeArg,

    /// Table name used in generated SQL.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_SQL_TABLE",
        default_value = "questions"
    )]
    sql_table: String,

    /// Omit the CREATE TABLE statement.
    #[arg(long, global = true, env = "EXAM2SQL_NO_CREATE_TABLE")]
    no_create_table: bool,

    /// Interactive `sql` merges every response file, not just the last run's.
    #[arg(long, global = true, env = "EXAM2SQL_ALL_RESPONSES")]
    all_responses: bool,

    /// Path to a text file containing a custom page system prompt.
    #[arg(long, global = true, env = "EXAM2SQL_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Do not attach page images to LLM requests (OCR text only).
    #[arg(long, global = true, env = "EXAM2SQL_NO_PAGE_IMAGES")]
    no_page_images: bool,

    /// Max LLM output tokens per page.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_MAX_TOKENS",
        default_value_t = 4096
    )]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_TEMPERATURE",
        default_value_t = 0.1
    )]
    temperature: f32,

    /// Retries per LLM call (0 = fail on first error).
    #[arg(long, global = true, env = "EXAM2SQL_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_API_TIMEOUT",
        default_value_t = 120
    )]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(
        long,
        global = true,
        env = "EXAM2SQL_DOWNLOAD_TIMEOUT",
        default_value_t = 120
    )]
    download_timeout: u64,

    /// Longest edge of rendered pages, in pixels.
    #[arg(long, global = true, env = "EXAM2SQL_MAX_PIXELS", default_value_t = 2000,
          value_parser = clap::value_parser!(u32).range(200..=10000))]
    max_pixels: u32,

    /// Path to libpdfium (default: system library).
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Disable the progress spinner.
    #[arg(long, global = true, env = "EXAM2SQL_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EXAM2SQL_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "EXAM2SQL_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum SqlModeArg {
    Template,
    Llm,
}

impl From<SqlModeArg> for SqlMode {
    fn from(v: SqlModeArg) -> Self {
        match v {
            SqlModeArg::Template => SqlMode::Template,
            SqlModeArg::Llm => SqlMode::Llm,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs are suppressed while the spinner is active; the
    // status lines carry everything the user needs.
    let show_progress = !opts.quiet && !opts.no_progress;
    let filter = if opts.verbose {
        "debug"
    } else if opts.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(opts).await?;
    let workflow = Workflow::new(config).context("Failed to prepare workspace")?;
    let observer = CliObserver::new(show_progress, opts.quiet);

    let result = match cli.command {
        Command::Process {
            ref input,
            generate_sql,
        } => run_process(&workflow, input, generate_sql, &observer).await,
        Command::GenerateSql { ref run, all } => {
            let scope = resolve_scope(&workflow, run.as_deref(), all)?;
            run_generate_sql(&workflow, scope, &observer).await
        }
        Command::Interactive => run_interactive(workflow, Arc::clone(&observer)).await,
    };

    observer.finish();
    result
}

/// Drain an action's events into the observer, then return its result.
async fn drive<T>(
    mut action: BackgroundAction<T>,
    observer: &CliObserver,
) -> Result<T, Exam2SqlError> {
    while let Some(event) = action.events.next().await {
        event.dispatch(observer);
    }
    action.join().await
}

async fn run_process(
    workflow: &Workflow,
    input: &str,
    generate_sql: bool,
    observer: &CliObserver,
) -> Result<()> {
    let outcome = drive(spawn_process(workflow.clone(), input), observer)
        .await
        .context("Processing failed")?;

    if !observer.quiet {
        eprintln!(
            "{}  run {}  {} pages  {} records",
            green("✔"),
            bold(&outcome.manifest.run_id),
            outcome.page_images.len(),
            outcome.records().len(),
        );
    }

    if generate_sql {
        run_generate_sql(workflow, AggregationScope::Run(outcome.manifest), observer).await?;
    }
    Ok(())
}

async fn run_generate_sql(
    workflow: &Workflow,
    scope: AggregationScope,
    observer: &CliObserver,
) -> Result<()> {
    let outcome = drive(spawn_generate_sql(workflow.clone(), scope), observer)
        .await
        .context("SQL generation failed")?;

    if !observer.quiet {
        eprintln!(
            "{}  {} records  →  {}{}",
            green("✔"),
            outcome.record_count,
            bold(&outcome.sql_path.display().to_string()),
            if outcome.skipped > 0 {
                dim(&format!("  ({} files skipped)", outcome.skipped))
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

/// `--all` scans everything; `--run` loads that manifest; otherwise the
/// latest run, falling back to a full scan when there is none.
fn resolve_scope(workflow: &Workflow, run: Option<&str>, all: bool) -> Result<AggregationScope> {
    if all {
        return Ok(AggregationScope::AllResponses);
    }
    let layout = workflow.layout();
    if let Some(run_id) = run {
        let manifest = RunManifest::load(layout, run_id)
            .with_context(|| format!("Cannot load run {run_id}"))?;
        return Ok(AggregationScope::Run(manifest));
    }
    Ok(match RunManifest::latest(layout).context("Failed to read run manifests")? {
        Some(manifest) => AggregationScope::Run(manifest),
        None => AggregationScope::AllResponses,
    })
}

async fn run_interactive(workflow: Workflow, observer: Arc<CliObserver>) -> Result<()> {
    let mut session = Session::new(workflow).with_observer(observer.clone());
    eprintln!(
        "{} {}",
        cyan("◆"),
        bold("Upload a PDF to start processing... (type `help` for commands)")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let prompt = if session.sql_enabled() {
            "[sql ready]>"
        } else {
            ">"
        };
        eprint!("{} ", dim(prompt));
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));

        match cmd {
            "" => {}
            "upload" | "u" => {
                let selection = Some(arg.trim()).filter(|s| !s.is_empty());
                if let Err(e) = session.upload_and_process(selection).await {
                    report_unstaged(&e);
                }
                observer.finish();
            }
            "sql" | "s" => {
                if let Err(e) = session.generate_sql().await {
                    report_unstaged(&e);
                }
                observer.finish();
            }
            "log" | "l" => eprint!("{}", session.log().text()),
            "status" => {
                eprintln!("status: {}", session.phase());
                if let Some(run) = session.last_run() {
                    eprintln!(
                        "last run: {} ({}, {} pages)",
                        run.run_id, run.source, run.page_count
                    );
                }
            }
            "help" | "?" => eprintln!("commands: upload <path|url>, sql, log, status, quit"),
            "quit" | "exit" | "q" => break,
            other => {
                let msg = format!("unknown command: {other} (try `help`)");
                eprintln!("{}", red(&msg));
            }
        }
    }
    Ok(())
}

/// Print errors the observer never saw.
fn report_unstaged(err: &Exam2SqlError) {
    if let Some(msg) = unstaged_message(err) {
        eprintln!("{}", red(&msg));
    }
}

/// Stage failures were already shown as `❌ Error during …` lines.
fn unstaged_message(err: &Exam2SqlError) -> Option<String> {
    match err.stage() {
        Some(_) => None,
        None => Some(err.to_string()),
    }
}

/// Map CLI args to `WorkflowConfig`.
async fn build_config(opts: &GlobalOpts) -> Result<WorkflowConfig> {
    let system_prompt = if let Some(ref path) = opts.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = WorkflowConfig::builder()
        .workspace_root(&opts.workspace)
        .max_rendered_pixels(opts.max_pixels)
        .tesseract_bin(&opts.tesseract)
        .ocr_language(&opts.ocr_lang)
        .detector_program(&opts.detector)
        .detector_args(opts.detector_args.clone())
        .model_weights(&opts.weights)
        .confidence_threshold(opts.confidence)
        .temperature(opts.temperature)
        .max_tokens(opts.max_tokens)
        .max_retries(opts.max_retries)
        .api_timeout_secs(opts.api_timeout)
        .attach_page_images(!opts.no_page_images)
        .download_timeout_secs(opts.download_timeout)
        .sql_label(&opts.sql_label)
        .sql_mode(opts.sql_mode.clone().into())
        .sql_table(&opts.sql_table)
        .create_table(!opts.no_create_table)
        .response_scope(if opts.all_responses {
            ResponseScope::AllResponses
        } else {
            ResponseScope::CurrentRun
        });

    if let Some(ref lib) = opts.pdfium_lib {
        builder = builder.pdfium_library(lib);
    }
    if let Some(ref model) = opts.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = opts.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}

//! Response aggregation: many per-page JSON lists → one merged list.
//!
//! A file that cannot be read, is not JSON, or whose top-level value is not
//! a list is skipped and reported; the remaining files are still merged.
//! Nothing is written when no list data is found.

use crate::error::{Exam2SqlError, SkipReason, SkippedFile};
use crate::layout::{write_json, MERGED_FILE_NAME};
use crate::manifest::RunManifest;
use crate::pipeline::postprocess::json_kind;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which response files to merge.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationScope {
    /// Every `.json` file in the responses directory except the merged
    /// file, ordered by run id and then page number.
    AllResponses,
    /// Only the files of one run, in manifest order.
    Run(RunManifest),
}

/// Outcome of a successful aggregation.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub records: Vec<Value>,
    /// Files whose records were merged.
    pub sources: Vec<PathBuf>,
    pub skipped: Vec<SkippedFile>,
    pub merged_path: PathBuf,
}

/// List the files `scope` covers.
pub fn response_files(
    responses_dir: &Path,
    scope: &AggregationScope,
) -> Result<Vec<PathBuf>, Exam2SqlError> {
    match scope {
        AggregationScope::Run(manifest) => Ok(manifest.response_files.clone()),
        AggregationScope::AllResponses => scan_responses(responses_dir),
    }
}

fn scan_responses(dir: &Path) -> Result<Vec<PathBuf>, Exam2SqlError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Exam2SqlError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Exam2SqlError::io(dir, e))?.path();
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let is_merged = path.file_name().and_then(|n| n.to_str()) == Some(MERGED_FILE_NAME);
        if path.is_file() && is_json && !is_merged {
            files.push(path);
        }
    }
    files.sort_by_cached_key(|path| response_sort_key(path));
    Ok(files)
}

/// `<run>_page_<n>.json` orders by run, then numeric page; other names
/// sort by name alone.
fn response_sort_key(path: &Path) -> (String, u64, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".json").unwrap_or(&name);
    let (run, page) = stem
        .rsplit_once("_page_")
        .and_then(|(run, page)| Some((run, page.parse::<u64>().ok()?)))
        .unwrap_or((stem, 0));
    let run = run.to_string();
    (run, page, name)
}

/// Read one response file as a list of records.
pub fn read_response_file(path: &Path) -> Result<Vec<Value>, SkipReason> {
    let bytes = std::fs::read(path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| SkipReason::InvalidJson(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(SkipReason::NotAList {
            kind: json_kind(&other).to_string(),
        }),
    }
}

/// Merge the files in `scope` and write `<responses_dir>/merged_data.json`.
///
/// `on_skip` is called for every skipped file as it is found.
pub fn aggregate_responses(
    responses_dir: &Path,
    scope: &AggregationScope,
    mut on_skip: impl FnMut(&SkippedFile),
) -> Result<Aggregation, Exam2SqlError> {
    let files = response_files(responses_dir, scope)?;
    debug!("Aggregating {} response files", files.len());

    let mut records = Vec::new();
    let mut sources = Vec::new();
    let mut skipped = Vec::new();

    for file in files {
        match read_response_file(&file) {
            Ok(items) => {
                debug!("{}: {} records", file.display(), items.len());
                records.extend(items);
                sources.push(file);
            }
            Err(reason) => {
                let skip = SkippedFile { file, reason };
                warn!("Skipping {}", skip);
                on_skip(&skip);
                skipped.push(skip);
            }
        }
    }

    if records.is_empty() {
        return Err(Exam2SqlError::NoResponseData {
            dir: responses_dir.to_path_buf(),
        });
    }

    let merged_path = responses_dir.join(MERGED_FILE_NAME);
    write_json(&merged_path, &records)?;
    info!(
        "Merged {} records from {} files into {} ({} skipped)",
        records.len(),
        sources.len(),
        merged_path.display(),
        skipped.len()
    );

    Ok(Aggregation {
        records,
        sources,
        skipped,
        merged_path,
    })
}

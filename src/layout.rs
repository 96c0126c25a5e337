//! Workspace directory layout.
//!
//! Every artifact of a run is owned by the directory it is written to.
//! [`WorkspaceLayout`] names those directories once so that no stage builds
//! paths by hand.

use crate::error::Exam2SqlError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the merged response collection inside `responses/`.
pub const MERGED_FILE_NAME: &str = "merged_data.json";

/// File name of the detector predictions inside `static/output_with_boxes/`.
pub const PREDICTIONS_FILE_NAME: &str = "predictions.json";

/// All workspace locations, relative to one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub uploads: PathBuf,
    pub responses: PathBuf,
    pub runs: PathBuf,
    pub page_images: PathBuf,
    pub ocr_text: PathBuf,
    pub output_with_boxes: PathBuf,
    pub cropped_diagrams: PathBuf,
    pub sql_outputs: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let stat = root.join("static");
        Self {
            uploads: root.join("uploads"),
            responses: root.join("responses"),
            runs: root.join("runs"),
            page_images: stat.join("page_images"),
            ocr_text: stat.join("ocr_text"),
            output_with_boxes: stat.join("output_with_boxes"),
            cropped_diagrams: stat.join("cropped_diagrams"),
            sql_outputs: root.join("sql_outputs"),
            root,
        }
    }

    /// Create every directory. Safe to call repeatedly.
    pub fn ensure(&self) -> Result<(), Exam2SqlError> {
        for dir in self.dirs() {
            std::fs::create_dir_all(dir).map_err(|e| Exam2SqlError::io(dir, e))?;
        }
        debug!("Workspace ready at {}", self.root.display());
        Ok(())
    }

    fn dirs(&self) -> [&Path; 8] {
        [
            &self.uploads,
            &self.responses,
            &self.runs,
            &self.page_images,
            &self.ocr_text,
            &self.output_with_boxes,
            &self.cropped_diagrams,
            &self.sql_outputs,
        ]
    }

    /// The diagram-info document, overwritten per run.
    pub fn diagram_info(&self) -> PathBuf {
        self.root.join("diagram_info.json")
    }

    /// The merged response collection, overwritten per SQL action.
    pub fn merged_responses(&self) -> PathBuf {
        self.responses.join(MERGED_FILE_NAME)
    }

    /// The detector predictions document.
    pub fn predictions(&self) -> PathBuf {
        self.output_with_boxes.join(PREDICTIONS_FILE_NAME)
    }

    /// OCR text file for a page image: `<stem>.txt`.
    pub fn ocr_text_for(&self, image: &Path) -> PathBuf {
        self.ocr_text.join(format!("{}.txt", page_stem(image)))
    }

    /// Response file for one page of a run.
    pub fn response_for(&self, run_id: &str, page_number: usize) -> PathBuf {
        self.responses
            .join(format!("{run_id}_page_{page_number}.json"))
    }

    /// Manifest of a run.
    pub fn manifest_for(&self, run_id: &str) -> PathBuf {
        self.runs.join(format!("{run_id}.json"))
    }
}

/// Base name of a page image without its extension, e.g. `page_1`.
pub fn page_stem(image: &Path) -> String {
    image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_string())
}

/// Path of the SQL output for `label`: `<sql_dir>/<label>_output.sql`.
pub fn sql_output_path(sql_dir: &Path, label: &str) -> PathBuf {
    sql_dir.join(format!("{label}_output.sql"))
}

/// Write `contents` to `path` atomically (temp file in the same directory,
/// then rename), so readers never see a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), Exam2SqlError> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| Exam2SqlError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Exam2SqlError::io(dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| Exam2SqlError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| Exam2SqlError::io(path, e.error))?;
    Ok(())
}

/// Serialise `value` as pretty JSON and write it atomically.
pub fn write_json<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), Exam2SqlError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| Exam2SqlError::json(path, e))?;
    write_atomic(path, &json)
}

/// Read and deserialise a JSON document.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Exam2SqlError> {
    let bytes = std::fs::read(path).map_err(|e| Exam2SqlError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Exam2SqlError::json(path, e))
}

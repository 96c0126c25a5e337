//! Run manifests: the explicit list of response files a run produced.
//!
//! The SQL action of a session reads the manifest of the last successful
//! run instead of everything that has accumulated in `responses/`, so data
//! from earlier runs does not bleed into the output.

use crate::error::Exam2SqlError;
use crate::layout::{read_json, write_json, WorkspaceLayout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    /// What the user selected (path or URL).
    pub source: String,
    /// The copy under `uploads/`.
    pub upload: PathBuf,
    pub page_count: usize,
    /// Response files in page order.
    pub response_files: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn save(&self, layout: &WorkspaceLayout) -> Result<PathBuf, Exam2SqlError> {
        let path = layout.manifest_for(&self.run_id);
        write_json(&path, self)?;
        Ok(path)
    }

    pub fn load(layout: &WorkspaceLayout, run_id: &str) -> Result<Self, Exam2SqlError> {
        let path = layout.manifest_for(run_id);
        if !path.exists() {
            return Err(Exam2SqlError::UnknownRun {
                run_id: run_id.to_string(),
            });
        }
        read_json(&path)
    }

    /// The most recently created manifest in the workspace, if any.
    pub fn latest(layout: &WorkspaceLayout) -> Result<Option<Self>, Exam2SqlError> {
        let entries = match std::fs::read_dir(&layout.runs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Exam2SqlError::io(&layout.runs, e)),
        };

        let mut latest: Option<RunManifest> = None;
        for entry in entries {
            let path = entry.map_err(|e| Exam2SqlError::io(&layout.runs, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(manifest) = read_json::<RunManifest>(&path) else {
                tracing::warn!("Ignoring unreadable manifest {}", path.display());
                continue;
            };
            if latest
                .as_ref()
                .map_or(true, |l| manifest.created_at > l.created_at)
            {
                latest = Some(manifest);
            }
        }
        Ok(latest)
    }
}

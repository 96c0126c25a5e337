//! Intake: copy the user's selection into the upload directory.
//!
//! The copy gets a fresh UUIDv4 name (`<32 hex digits>.pdf`) so repeated
//! uploads of the same file never collide, and that token becomes the run
//! id. No PDF validation happens here; a malformed file surfaces as a
//! rasterisation failure in the next stage.

use crate::error::Exam2SqlError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The uploaded copy of a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub run_id: String,
    /// What the user selected.
    pub source: String,
    /// Where the bytes now live.
    pub path: PathBuf,
}

/// Check if the selection looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Generate a collision-resistant upload token.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Copy (or download) `selection` into `uploads_dir` under a unique name.
pub async fn upload(
    selection: &str,
    uploads_dir: &Path,
    download_timeout_secs: u64,
) -> Result<Upload, Exam2SqlError> {
    let selection = selection.trim();
    if selection.is_empty() {
        return Err(Exam2SqlError::NoFileSelected);
    }

    tokio::fs::create_dir_all(uploads_dir)
        .await
        .map_err(|e| Exam2SqlError::io(uploads_dir, e))?;

    let run_id = new_run_id();
    let dest = uploads_dir.join(format!("{run_id}.pdf"));

    if is_url(selection) {
        download_url(selection, &dest, download_timeout_secs).await?;
    } else {
        copy_local(Path::new(selection), &dest).await?;
    }

    info!("Uploaded {} → {}", selection, dest.display());
    Ok(Upload {
        run_id,
        source: selection.to_string(),
        path: dest,
    })
}

async fn copy_local(source: &Path, dest: &Path) -> Result<(), Exam2SqlError> {
    let meta = match tokio::fs::metadata(source).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Exam2SqlError::PermissionDenied {
                path: source.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(Exam2SqlError::FileNotFound {
                path: source.to_path_buf(),
            })
        }
    };
    if !meta.is_file() {
        return Err(Exam2SqlError::FileNotFound {
            path: source.to_path_buf(),
        });
    }

    match tokio::fs::copy(source, dest).await {
        Ok(bytes) => {
            debug!("Copied {} bytes", bytes);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(Exam2SqlError::PermissionDenied {
                path: source.to_path_buf(),
            })
        }
        Err(e) => Err(Exam2SqlError::io(dest, e)),
    }
}

/// Download a URL straight into the upload location.
async fn download_url(url: &str, dest: &Path, timeout_secs: u64) -> Result<(), Exam2SqlError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Exam2SqlError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Exam2SqlError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            Exam2SqlError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(Exam2SqlError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Exam2SqlError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| Exam2SqlError::io(dest, e))
}

/// Name shown for an upload: the file name of a path, or the URL itself.
pub fn display_name(selection: &str) -> String {
    if is_url(selection) {
        return selection.to_string();
    }
    PathBuf::from(selection)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| selection.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/exam.pdf"));
        assert!(is_url("http://example.com/exam.pdf"));
        assert!(!is_url("/tmp/exam.pdf"));
        assert!(!is_url("exam.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn run_ids_are_unique_hex() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn upload_copies_bytes_under_unique_name() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("sample.pdf");
        std::fs::write(&src, b"not really a pdf").unwrap();
        let uploads = tmp.path().join("uploads");

        let first = upload(src.to_str().unwrap(), &uploads, 5).await.unwrap();
        let second = upload(src.to_str().unwrap(), &uploads, 5).await.unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(first.path.extension().unwrap(), "pdf");
        assert_eq!(
            first.path.file_stem().unwrap().to_str().unwrap(),
            first.run_id
        );
        assert_eq!(std::fs::read(&first.path).unwrap(), b"not really a pdf");
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = upload("  ", tmp.path(), 5).await.unwrap_err();
        assert!(matches!(err, Exam2SqlError::NoFileSelected));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let err = upload("/definitely/not/here.pdf", tmp.path(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Exam2SqlError::FileNotFound { .. }));
    }

    #[test]
    fn display_name_strips_dirs() {
        assert_eq!(display_name("/a/b/exam.pdf"), "exam.pdf");
        assert_eq!(
            display_name("https://x.org/exam.pdf"),
            "https://x.org/exam.pdf"
        );
    }
}

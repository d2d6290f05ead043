use std::io::ErrorKind;
use std::path::Path;

use tracing::warn;

use crate::error::{LifecycleError, LifecycleResult};

/// Remove a directory tree; a missing directory is not an error.
pub(crate) async fn remove_dir(path: &Path) -> LifecycleResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(LifecycleError::io(path)(e)),
        _ => Ok(()),
    }
}

/// Remove a file, logging anything other than "not found".
pub(crate) async fn remove_file_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}

/// Write `contents`, creating the parent directory first.
pub(crate) async fn write_file(path: &Path, contents: &str) -> LifecycleResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(LifecycleError::io(parent))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(LifecycleError::io(path))
}

/// Read a text file; a missing file reads as `None`.
pub(crate) async fn read_optional(path: &Path) -> LifecycleResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LifecycleError::io(path)(e)),
    }
}

//! Orchestrator-authored lines in a job log.
//!
//! Subprocess output goes straight into the same file. Lines written here
//! are prefixed with a local timestamp so they stand out in a stream.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create (or truncate) the file and its parent directory.
    pub async fn create(&self) -> LifecycleResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(LifecycleError::io(parent))?;
        }
        tokio::fs::File::create(&self.path)
            .await
            .map_err(LifecycleError::io(&self.path))?;
        Ok(())
    }

    /// Append `[YYYY-MM-DD HH:MM:SS] msg` to a log created by [`create`].
    /// Failures are logged and dropped. A log removed underneath the job
    /// stays removed.
    ///
    /// [`create`]: JobLog::create
    pub async fn line(&self, msg: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let text = format!("[{stamp}] {}\n", msg.as_ref());
        let write = async {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await
        };
        match write.await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "job log gone, line dropped");
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to write job log line"),
        }
    }
}

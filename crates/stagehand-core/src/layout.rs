//! Filesystem layout under the Stagehand root directory.
//!
//! ```text
//! <root>/
//!   repos/<stage_id>/          per-stage checkout
//!   env/template/.env          template seeded into new stages
//!   env/<stage_id>/.env        per-stage configuration
//!   runtime/logs/tests/        one log per test run
//!   runtime/logs/deployments/  one log per deployment
//!   builds/<version>           built artifacts
//!   state.redb                 lifecycle store
//! ```

use std::io;
use std::path::{Path, PathBuf};

const ENV_FILE: &str = ".env";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn env_root(&self) -> PathBuf {
        self.root.join("env")
    }

    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("runtime").join("logs")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.redb")
    }

    pub fn stage_repo(&self, stage_id: &str) -> PathBuf {
        self.repos_dir().join(stage_id)
    }

    pub fn stage_env_dir(&self, stage_id: &str) -> PathBuf {
        self.env_root().join(stage_id)
    }

    pub fn stage_env_file(&self, stage_id: &str) -> PathBuf {
        self.stage_env_dir(stage_id).join(ENV_FILE)
    }

    pub fn template_env_file(&self) -> PathBuf {
        self.env_root().join("template").join(ENV_FILE)
    }

    pub fn test_log(&self, test_id: &str) -> PathBuf {
        self.logs_dir().join("tests").join(format!("{test_id}.log"))
    }

    pub fn deployment_log(&self, deployment_id: &str) -> PathBuf {
        self.logs_dir()
            .join("deployments")
            .join(format!("{deployment_id}.log"))
    }

    /// Path of the artifact built for `version`.
    pub fn binary_path(&self, version: &str) -> PathBuf {
        self.builds_dir().join(crate::binary_name(version))
    }

    /// Create every directory the daemon writes into.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.repos_dir(),
            self.env_root().join("template"),
            self.logs_dir().join("tests"),
            self.logs_dir().join("deployments"),
            self.builds_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

//! Source control: discovering release tags and checking them out.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{LifecycleError, LifecycleResult};

/// A tag advertised by the remote repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTag {
    pub name: String,
    pub sha: String,
}

/// Abstraction over the managed application's repository for testability.
///
/// Real implementation: [`GitCli`] shells out to `git`.
/// Test double: `testing::FakeScm`.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn list_tags(&self) -> LifecycleResult<Vec<RemoteTag>>;

    /// Materialize `sha` as a detached working tree at `dest`. Any previous
    /// contents of `dest` are replaced.
    async fn checkout(&self, sha: &str, dest: &Path) -> LifecycleResult<()>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    repo_url: String,
    git: String,
}

impl GitCli {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            git: "git".to_string(),
        }
    }

    async fn git(&self, tool: &'static str, args: &[&str]) -> LifecycleResult<String> {
        debug!(?args, "running git");
        let output = Command::new(&self.git)
            .args(args)
            .output()
            .await
            .map_err(|e| LifecycleError::upstream(tool, e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LifecycleError::upstream(
                tool,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn list_tags(&self) -> LifecycleResult<Vec<RemoteTag>> {
        let out = self
            .git("git ls-remote", &["ls-remote", "--tags", &self.repo_url])
            .await?;
        Ok(parse_ls_remote(&out))
    }

    async fn checkout(&self, sha: &str, dest: &Path) -> LifecycleResult<()> {
        match tokio::fs::remove_dir_all(dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LifecycleError::io(dest)(e)),
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(LifecycleError::io(parent))?;
        }
        let dest_str = dest.to_string_lossy();
        self.git("git clone", &["clone", "--quiet", &self.repo_url, &dest_str])
            .await?;
        self.git(
            "git checkout",
            &["-C", &dest_str, "checkout", "--quiet", "--detach", sha],
        )
        .await?;
        info!(%sha, dest = %dest.display(), "release checked out");
        Ok(())
    }
}

/// Parse `git ls-remote --tags` output into tags.
///
/// Peeled entries (`refs/tags/x^{}`) are skipped; the plain ref wins.
pub fn parse_ls_remote(output: &str) -> Vec<RemoteTag> {
    output
        .lines()
        .filter_map(|line| {
            let (sha, reference) = line.split_once('\t')?;
            let name = reference.trim().strip_prefix("refs/tags/")?;
            if name.is_empty() || name.ends_with("^{}") {
                return None;
            }
            Some(RemoteTag {
                name: name.to_string(),
                sha: sha.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_and_skips_peeled() {
        let out = "\
aaa111\trefs/tags/v1.0.0
bbb222\trefs/tags/v1.0.0^{}
ccc333\trefs/tags/v1.1.0
ddd444\trefs/heads/main
garbage line
";
        let tags = parse_ls_remote(out);
        assert_eq!(
            tags,
            vec![
                RemoteTag { name: "v1.0.0".into(), sha: "aaa111".into() },
                RemoteTag { name: "v1.1.0".into(), sha: "ccc333".into() },
            ]
        );
    }

    #[test]
    fn empty_output() {
        assert!(parse_ls_remote("").is_empty());
    }
}

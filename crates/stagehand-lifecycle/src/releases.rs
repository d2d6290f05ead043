//! Release discovery from the remote repository's tags.

use std::sync::Arc;

use tracing::info;

use stagehand_core::epoch_secs;
use stagehand_state::{Release, StateStore};

use crate::error::LifecycleResult;
use crate::scm::SourceControl;

#[derive(Clone)]
pub struct ReleaseSync {
    store: StateStore,
    scm: Arc<dyn SourceControl>,
}

impl ReleaseSync {
    pub fn new(store: StateStore, scm: Arc<dyn SourceControl>) -> Self {
        Self { store, scm }
    }

    /// Record every remote tag not yet known. Existing releases are never
    /// rewritten. Returns the releases created by this call.
    pub async fn sync_releases(&self) -> LifecycleResult<Vec<Release>> {
        let tags = self.scm.list_tags().await?;
        let now = epoch_secs();
        let mut created = Vec::new();
        for tag in tags {
            if self.store.get_release(&tag.name)?.is_some() {
                continue;
            }
            let release = Release {
                id: tag.name,
                sha: tag.sha,
                created_at: now,
            };
            self.store.put_release(&release)?;
            created.push(release);
        }
        info!(created = created.len(), "releases synced");
        Ok(created)
    }

    /// Newest first.
    pub fn list_releases(&self) -> LifecycleResult<Vec<Release>> {
        Ok(self.store.list_releases()?)
    }
}

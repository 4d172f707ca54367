use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCleanup {
    pub removed: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    /// Path and error for each key that could not be removed.
    pub failed: Vec<(PathBuf, String)>,
}

impl KeyCleanup {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes credentials that belonged to the node's secondary role.
#[async_trait]
pub trait KeyCleaner: Send + Sync {
    async fn remove_stale_keys(&self) -> KeyCleanup;
}

pub struct FsKeyCleaner {
    paths: Vec<PathBuf>,
}

impl FsKeyCleaner {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl KeyCleaner for FsKeyCleaner {
    async fn remove_stale_keys(&self) -> KeyCleanup {
        let mut cleanup = KeyCleanup::default();
        for path in &self.paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale key");
                    cleanup.removed.push(path.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "stale key already absent");
                    cleanup.missing.push(path.clone());
                }
                Err(e) => cleanup.failed.push((path.clone(), e.to_string())),
            }
        }
        cleanup
    }
}

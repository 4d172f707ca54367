//! Common fakes for replication integration tests.

use async_trait::async_trait;
use geoctl_repl::{BackupTarget, BaseBackup, ReplError, SrvResolver, SrvTarget};
use hickory_resolver::error::ResolveError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

/// Backup that records every target it was asked to copy.
#[derive(Default)]
pub struct RecordingBackup {
    pub started: Mutex<Vec<BackupTarget>>,
}

impl RecordingBackup {
    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait]
impl BaseBackup for RecordingBackup {
    async fn run(&self, target: &BackupTarget, destination: &Path) -> Result<(), ReplError> {
        self.started.lock().unwrap().push(target.clone());
        std::fs::write(destination.join("PG_VERSION"), "16\n")?;
        Ok(())
    }
}

/// Registry DNS fake with a fixed record table.
#[derive(Default)]
pub struct StaticRegistry {
    pub records: HashMap<String, Vec<SrvTarget>>,
    pub addresses: HashMap<String, IpAddr>,
}

#[async_trait]
impl SrvResolver for StaticRegistry {
    async fn srv_records(&self, name: &str) -> Result<Vec<SrvTarget>, ResolveError> {
        Ok(self.records.get(name).cloned().unwrap_or_default())
    }

    async fn resolve_address(&self, target: &str) -> Result<IpAddr, ResolveError> {
        self.addresses
            .get(target)
            .copied()
            .ok_or_else(|| ResolveError::from(format!("no address for {}", target)))
    }
}

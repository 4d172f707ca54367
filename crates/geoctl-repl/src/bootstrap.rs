//! Attach a secondary to a primary's replication stream.
//!
//! An attach takes a full base backup of the primary into a staging directory
//! next to the data directory, then swaps it into place and marks the slot
//! active. The staging directory is owned by a guard for the whole transfer:
//!
//! - on error, timeout or cancellation the guard deletes the partial backup
//!   before the error is returned, and the slot is finalized `Failed`;
//! - if the process dies mid-transfer the guard cannot run, so every attach
//!   first sweeps an orphaned staging directory for the same slot;
//! - a slot left `Pending` by a dead process is not active and may be
//!   attached again;
//! - a slot is only `Active` once that state is on disk; if the registry
//!   cannot be written the attach fails and the slot is finalized `Failed`.
//!
//! The existing data directory is only touched after the backup completed. It
//! is moved aside to `<data_dir>.<timestamp>.bak`, and moved back if the new
//! copy cannot be installed in its place.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ReplError;
use crate::slot_registry::{ReplicationSlot, SlotRegistry};
use crate::ssl_mode::SslMode;

/// Where and how to take the base backup from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    /// Primary host.
    pub host: String,
    /// Primary database port.
    pub port: u16,
    /// Replication user.
    pub user: String,
    /// Replication slot name.
    pub slot_name: String,
    /// Transport security mode.
    pub ssl_mode: SslMode,
}

/// Capability that copies a primary into `destination` and configures it to follow.
#[async_trait]
pub trait BaseBackup: Send + Sync {
    /// Run the backup. `destination` exists and is empty.
    async fn run(&self, target: &BackupTarget, destination: &Path) -> Result<(), ReplError>;
}

/// [`BaseBackup`] that shells out to `pg_basebackup`.
#[derive(Debug, Clone)]
pub struct PgBaseBackup {
    program: PathBuf,
    create_slot: bool,
}

impl PgBaseBackup {
    /// Create a runner for `program`. With `create_slot` the slot is created on the primary.
    pub fn new(program: impl Into<PathBuf>, create_slot: bool) -> Self {
        Self {
            program: program.into(),
            create_slot,
        }
    }

    /// Arguments passed to the program for `target`.
    pub fn args(&self, target: &BackupTarget, destination: &Path) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            target.host.clone(),
            "-p".to_string(),
            target.port.to_string(),
            "-U".to_string(),
            target.user.clone(),
            "-D".to_string(),
            destination.display().to_string(),
            "-X".to_string(),
            "stream".to_string(),
            "-S".to_string(),
            target.slot_name.clone(),
        ];
        if self.create_slot {
            args.push("-C".to_string());
        }
        // Writes the standby signal and primary_conninfo so the copy follows the source.
        args.push("-R".to_string());
        args
    }
}

#[async_trait]
impl BaseBackup for PgBaseBackup {
    async fn run(&self, target: &BackupTarget, destination: &Path) -> Result<(), ReplError> {
        let args = self.args(target, destination);
        info!(program = %self.program.display(), host = %target.host, slot = %target.slot_name, "starting base backup");

        let output = Command::new(&self.program)
            .args(&args)
            .env("PGSSLMODE", target.ssl_mode.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ReplError::Replication {
                slot: target.slot_name.clone(),
                msg: format!("failed to spawn {}: {}", self.program.display(), e),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ReplError::Replication {
            slot: target.slot_name.clone(),
            msg: format!("{} exited with {}: {}", self.program.display(), output.status, stderr.trim()),
        })
    }
}

/// Replication settings for this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Local database data directory that receives the backup.
    pub data_dir: PathBuf,
    /// Where the slot registry is persisted.
    pub slot_registry: PathBuf,
    /// Primary database port.
    pub port: u16,
    /// Replication user on the primary.
    pub user: String,
    /// Base backup program.
    pub base_backup_program: PathBuf,
    /// Create the slot on the primary as part of the backup.
    pub create_slot: bool,
    /// Abort the backup after this many seconds. `None` waits indefinitely.
    pub backup_timeout_secs: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/opt/geoctl/postgresql/data"),
            slot_registry: PathBuf::from("/var/opt/geoctl/replication-slots.json"),
            port: 5432,
            user: "geo_replicator".to_string(),
            base_backup_program: PathBuf::from("pg_basebackup"),
            create_slot: true,
            backup_timeout_secs: None,
        }
    }
}

impl BootstrapConfig {
    /// Staging directory used while a backup for `slot_name` is in flight.
    pub fn staging_dir(&self, slot_name: &str) -> PathBuf {
        let base = self
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        self.data_dir
            .with_file_name(format!("{}.{}.partial", base, slot_name))
    }
}

/// Per-call attach options.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Port override for the primary.
    pub port: Option<u16>,
    /// Destroy an active slot of the same name and attach again.
    pub force: bool,
}

/// Scoped owner of a staging directory; removes it on drop unless installed.
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, armed: true })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn install(mut self, destination: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, destination)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "discarded partial base backup"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(path = %self.path.display(), error = %e, "failed to discard partial base backup"),
        }
    }
}

/// Attaches this node to a primary's replication stream.
pub struct ReplicationBootstrapper {
    config: BootstrapConfig,
    backup: Arc<dyn BaseBackup>,
    registry: Mutex<SlotRegistry>,
}

impl ReplicationBootstrapper {
    /// Create a bootstrapper using `pg_basebackup` and the on-disk slot registry.
    pub fn from_config(config: BootstrapConfig) -> Result<Self, ReplError> {
        let registry = SlotRegistry::open(&config.slot_registry)?;
        let backup = Arc::new(PgBaseBackup::new(
            config.base_backup_program.clone(),
            config.create_slot,
        ));
        Ok(Self::new(config, backup, registry))
    }

    /// Create a bootstrapper with an explicit backup capability and registry.
    pub fn new(config: BootstrapConfig, backup: Arc<dyn BaseBackup>, registry: SlotRegistry) -> Self {
        Self {
            config,
            backup,
            registry: Mutex::new(registry),
        }
    }

    /// Current record for `slot_name`.
    pub async fn slot(&self, slot_name: &str) -> Option<ReplicationSlot> {
        self.registry.lock().await.get(slot_name).cloned()
    }

    /// Attach to `host` through `slot_name` using `ssl_mode`.
    pub async fn attach(
        &self,
        host: &str,
        slot_name: &str,
        ssl_mode: SslMode,
        options: &AttachOptions,
        cancel: &CancellationToken,
    ) -> Result<ReplicationSlot, ReplError> {
        validate_host(host)?;
        validate_slot_name(slot_name)?;
        if !ssl_mode.is_encrypted() {
            warn!(host = %host, slot = %slot_name, "replication stream is not encrypted");
        }

        let port = options.port.unwrap_or(self.config.port);
        let mut registry = self.registry.lock().await;

        if options.force {
            if let Some(existing) = registry.get(slot_name).filter(|s| s.is_active()) {
                warn!(slot = %slot_name, previous = %existing.source_host, host = %host, "repointing active slot");
                registry.remove(slot_name)?;
            }
        }
        registry.begin(ReplicationSlot::pending(slot_name, host, port, ssl_mode))?;

        let target = BackupTarget {
            host: host.to_string(),
            port,
            user: self.config.user.clone(),
            slot_name: slot_name.to_string(),
            ssl_mode,
        };

        let attached = match self.transfer(&target, cancel).await {
            Ok(()) => registry.mark_active(slot_name),
            Err(e) => Err(e),
        };
        match attached {
            Ok(()) => {
                info!(slot = %slot_name, host = %host, port, "replication attached");
                registry
                    .get(slot_name)
                    .cloned()
                    .ok_or_else(|| ReplError::config(format!("slot {} vanished", slot_name)))
            }
            Err(e) => {
                let reason = match &e {
                    ReplError::Cancelled { .. } => "cancelled".to_string(),
                    other => other.to_string(),
                };
                if let Err(mark_err) = registry.mark_failed(slot_name, &reason) {
                    error!(slot = %slot_name, error = %mark_err, "failed to record slot failure");
                }
                warn!(slot = %slot_name, error = %e, "replication attach failed");
                Err(e)
            }
        }
    }

    async fn transfer(&self, target: &BackupTarget, cancel: &CancellationToken) -> Result<(), ReplError> {
        let staging_path = self.config.staging_dir(&target.slot_name);
        if staging_path.exists() {
            warn!(path = %staging_path.display(), "removing orphaned partial base backup");
            std::fs::remove_dir_all(&staging_path)?;
        }
        let staging = StagingDir::create(staging_path)?;

        let backup = self.backup.run(target, staging.path());
        let bounded = async {
            match self.config.backup_timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), backup)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ReplError::Replication {
                            slot: target.slot_name.clone(),
                            msg: format!("base backup timed out after {}s", secs),
                        })
                    }),
                None => backup.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ReplError::Cancelled { slot: target.slot_name.clone() });
            }
            result = bounded => result?,
        }

        let data_dir = &self.config.data_dir;
        if data_dir.exists() {
            let aside = PathBuf::from(format!(
                "{}.{}.bak",
                data_dir.display(),
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            info!(from = %data_dir.display(), to = %aside.display(), "moving previous data directory aside");
            std::fs::rename(data_dir, &aside)?;
            if let Err(e) = staging.install(data_dir) {
                error!(path = %data_dir.display(), error = %e, "failed to install base backup, restoring previous data directory");
                std::fs::rename(&aside, data_dir)?;
                return Err(e.into());
            }
        } else {
            staging.install(data_dir)?;
        }
        Ok(())
    }
}

fn validate_host(host: &str) -> Result<(), ReplError> {
    if host.trim().is_empty() {
        return Err(ReplError::config("primary host must not be empty"));
    }
    Ok(())
}

/// Slot names follow the database's rules: lower case letters, digits and underscores.
fn validate_slot_name(name: &str) -> Result<(), ReplError> {
    if name.is_empty() || name.len() > 63 {
        return Err(ReplError::config(format!(
            "slot name '{}' must be 1 to 63 characters",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ReplError::config(format!(
            "slot name '{}' may only contain lower case letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

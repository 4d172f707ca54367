use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::config::NodeConfig;

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("promote command failed with {status}: {stderr}")]
    PromoteCommand { status: String, stderr: String },
    #[error("role file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("role file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub role: NodeRole,
    pub service_address: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RoleFlipper: Send + Sync {
    async fn current(&self) -> Result<ClusterNode, RoleError>;
    /// Irreversible. Callers must not retry on failure.
    async fn promote(&self) -> Result<ClusterNode, RoleError>;
}

/// Runs the optional promote command, then persists the node role as JSON.
pub struct LocalRoleFlipper {
    node: NodeConfig,
}

impl LocalRoleFlipper {
    pub fn new(node: NodeConfig) -> Self {
        Self { node }
    }

    fn io_err(&self, source: std::io::Error) -> RoleError {
        RoleError::Io {
            path: self.node.role_file.clone(),
            source,
        }
    }

    async fn run_promote_command(&self) -> Result<(), RoleError> {
        let Some((program, args)) = self.node.promote_command.split_first() else {
            return Ok(());
        };
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RoleError::PromoteCommand {
                status: "not started".to_string(),
                stderr: source.to_string(),
            })?;
        if !output.status.success() {
            return Err(RoleError::PromoteCommand {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, node: &ClusterNode) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(node).map_err(std::io::Error::other)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

#[async_trait]
impl RoleFlipper for LocalRoleFlipper {
    async fn current(&self) -> Result<ClusterNode, RoleError> {
        match std::fs::read(&self.node.role_file) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClusterNode {
                id: self.node.id.clone(),
                role: NodeRole::Secondary,
                service_address: self.node.service_address.clone(),
                updated_at: Utc::now(),
            }),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn promote(&self) -> Result<ClusterNode, RoleError> {
        self.run_promote_command().await?;
        let node = ClusterNode {
            id: self.node.id.clone(),
            role: NodeRole::Primary,
            service_address: self.node.service_address.clone(),
            updated_at: Utc::now(),
        };
        write_atomic(&self.node.role_file, &node).map_err(|e| self.io_err(e))?;
        info!(node = %node.id, "node role set to primary");
        Ok(node)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};
use uuid::Uuid;

use crate::audit_trail::{AuditTrail, AuditTransition};
use crate::config::MigrationConfig;
use crate::lock::{LockError, LockRegistry};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {task} is already running")]
    InProgress { task: String },
    #[error("migration {} could not be started: {source}", .run.task_name)]
    Launch {
        run: Box<MigrationRun>,
        #[source]
        source: std::io::Error,
    },
    #[error("migration {} failed, see {}", .run.task_name, .run.log_path.display())]
    Failed { run: Box<MigrationRun> },
    #[error(transparent)]
    Lock(LockError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationRun {
    pub task_name: String,
    pub log_prefix: String,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<MigrationOutcome>,
    /// Exit status as reported by the executor.
    pub status: Option<String>,
}

impl MigrationRun {
    pub fn succeeded(&self) -> bool {
        self.outcome == Some(MigrationOutcome::Success)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecStatus {
    pub success: bool,
    pub description: String,
}

/// Runs a named migration task with all output captured into `log_path`.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn execute(&self, task: &str, log_path: &Path) -> std::io::Result<ExecStatus>;
}

/// `<command...> <task>` with stdout and stderr appended to the log file.
#[derive(Debug, Clone)]
pub struct CommandMigration {
    command: Vec<String>,
}

impl CommandMigration {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl MigrationExecutor for CommandMigration {
    async fn execute(&self, task: &str, log_path: &Path) -> std::io::Result<ExecStatus> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty migration command")
        })?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let status = Command::new(program)
            .args(args)
            .arg(task)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(ExecStatus {
            success: status.success(),
            description: status.to_string(),
        })
    }
}

pub struct MigrationRunner {
    log_dir: PathBuf,
    executor: Arc<dyn MigrationExecutor>,
    locks: LockRegistry,
    audit: Arc<AuditTrail>,
    history: Mutex<Vec<MigrationRun>>,
}

impl MigrationRunner {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        executor: Arc<dyn MigrationExecutor>,
        locks: LockRegistry,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            executor,
            locks,
            audit,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &MigrationConfig, locks: LockRegistry, audit: Arc<AuditTrail>) -> Self {
        Self::new(
            config.log_dir.clone(),
            Arc::new(CommandMigration::new(config.command.clone())),
            locks,
            audit,
        )
    }

    /// `<log_dir>/<prefix>-<YYYY-MM-DD-HH-MM-SS>.log`, UTC.
    pub fn log_path_for(&self, prefix: &str, at: DateTime<Utc>) -> PathBuf {
        self.log_dir
            .join(format!("{}-{}.log", prefix, at.format("%Y-%m-%d-%H-%M-%S")))
    }

    /// Run `task` to completion. At most one run per task name at a time.
    pub async fn run(
        &self,
        task: &str,
        log_prefix: &str,
        attempt: Option<Uuid>,
    ) -> Result<MigrationRun, MigrationError> {
        let _guard = self
            .locks
            .try_acquire(&format!("migration-{}", task))
            .map_err(|e| match e {
                LockError::Held { .. } => MigrationError::InProgress {
                    task: task.to_string(),
                },
                other => MigrationError::Lock(other),
            })?;

        let started_at = Utc::now();
        let mut run = MigrationRun {
            task_name: task.to_string(),
            log_prefix: log_prefix.to_string(),
            log_path: self.log_path_for(log_prefix, started_at),
            started_at,
            completed_at: None,
            outcome: None,
            status: None,
        };

        match self.launch(task, &run, attempt).await {
            Ok(status) => {
                self.finalize(&mut run, attempt, status.success, &status.description);
                if status.success {
                    info!(task = %task, "migration finished");
                    Ok(run)
                } else {
                    error!(task = %task, status = %status.description, log = %run.log_path.display(), "migration failed");
                    Err(MigrationError::Failed { run: Box::new(run) })
                }
            }
            Err(source) => {
                self.finalize(&mut run, attempt, false, &source.to_string());
                error!(task = %task, error = %source, "migration could not be started");
                Err(MigrationError::Launch {
                    run: Box::new(run),
                    source,
                })
            }
        }
    }

    async fn launch(
        &self,
        task: &str,
        run: &MigrationRun,
        attempt: Option<Uuid>,
    ) -> std::io::Result<ExecStatus> {
        std::fs::create_dir_all(&self.log_dir)?;
        info!(task = %task, log = %run.log_path.display(), "running migration");
        self.audit.record(
            attempt,
            task,
            AuditTransition::MigrationStarted,
            &run.log_path.display().to_string(),
            true,
        );
        self.executor.execute(task, &run.log_path).await
    }

    /// Every started run ends here, whatever happened to it.
    fn finalize(&self, run: &mut MigrationRun, attempt: Option<Uuid>, success: bool, status: &str) {
        run.completed_at = Some(Utc::now());
        run.status = Some(status.to_string());
        run.outcome = Some(if success {
            MigrationOutcome::Success
        } else {
            MigrationOutcome::Failed
        });
        self.audit.record(
            attempt,
            &run.task_name,
            AuditTransition::MigrationFinished,
            status,
            success,
        );
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(run.clone());
    }

    pub fn history(&self) -> Vec<MigrationRun> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

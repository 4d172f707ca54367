//! Promotion of a secondary site to primary.
//!
//! One attempt walks a fixed sequence of states:
//!
//! ```text
//! IDLE -> PREFLIGHT -> AWAIT_CONFIRM_PRIMARY_DOWN -> QUIESCE_SERVICES -> RUN_MIGRATIONS
//!      -> FLIP_ROLE -> REMOVE_STALE_KEYS -> RESUME_SERVICES -> DONE
//! ```
//!
//! `PREFLIGHT` is skipped on request and any state may fail. Nothing is
//! mutated before the operator confirms the old primary is down, and once the
//! role flip has been committed the attempt only moves forward: later problems
//! become warnings on the report instead of failures.

use anyhow::Context;
use chrono::{DateTime, Utc};
use geoctl_repl::{PrimaryLocator, SlotRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit_trail::{AuditTrail, AuditTransition};
use crate::config::GeoConfig;
use crate::confirmation::{ConfirmationError, ConfirmationProvider, Question};
use crate::keys::{FsKeyCleaner, KeyCleaner};
use crate::lock::{LockError, LockRegistry};
use crate::migration::{MigrationError, MigrationRunner};
use crate::preflight::PreflightSuite;
use crate::role::{LocalRoleFlipper, RoleError, RoleFlipper};
use crate::services::{CommandSupervisor, ServiceDependencyController, ServiceError};

/// Name of the advisory lock held for the whole attempt.
pub const PROMOTION_LOCK: &str = "promote-to-primary-node";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionState {
    Idle,
    Preflight,
    AwaitConfirmPrimaryDown,
    QuiesceServices,
    RunMigrations,
    FlipRole,
    RemoveStaleKeys,
    ResumeServices,
    Done,
    Failed,
}

impl PromotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionState::Idle => "IDLE",
            PromotionState::Preflight => "PREFLIGHT",
            PromotionState::AwaitConfirmPrimaryDown => "AWAIT_CONFIRM_PRIMARY_DOWN",
            PromotionState::QuiesceServices => "QUIESCE_SERVICES",
            PromotionState::RunMigrations => "RUN_MIGRATIONS",
            PromotionState::FlipRole => "FLIP_ROLE",
            PromotionState::RemoveStaleKeys => "REMOVE_STALE_KEYS",
            PromotionState::ResumeServices => "RESUME_SERVICES",
            PromotionState::Done => "DONE",
            PromotionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PromotionState::Done | PromotionState::Failed)
    }

    /// States in which an operator cancellation is honoured.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            PromotionState::Idle | PromotionState::Preflight | PromotionState::AwaitConfirmPrimaryDown
        )
    }

    /// Forward edges only, plus `FAILED` from any non-terminal state.
    pub fn can_transition_to(&self, next: PromotionState) -> bool {
        use PromotionState::*;
        match (*self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Preflight | AwaitConfirmPrimaryDown)
            | (Preflight, AwaitConfirmPrimaryDown)
            | (AwaitConfirmPrimaryDown, QuiesceServices)
            | (QuiesceServices, RunMigrations)
            | (RunMigrations, FlipRole)
            | (FlipRole, RemoveStaleKeys)
            | (RemoveStaleKeys, ResumeServices)
            | (ResumeServices, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PromotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intent for one attempt. `None` asks the confirmation provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionRequest {
    pub confirm_primary_down: Option<bool>,
    pub confirm_removing_keys: Option<bool>,
    pub skip_preflight_checks: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Configuration,
    InProgress,
    Preflight,
    ConfirmationRefused,
    ServiceStop,
    Migration,
    RoleFlip,
    Cancelled,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Configuration => "configuration",
            FailureCategory::InProgress => "in-progress",
            FailureCategory::Preflight => "preflight",
            FailureCategory::ConfirmationRefused => "confirmation-refused",
            FailureCategory::ServiceStop => "service-stop",
            FailureCategory::Migration => "migration",
            FailureCategory::RoleFlip => "role-flip",
            FailureCategory::Cancelled => "cancelled",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            FailureCategory::Configuration | FailureCategory::InProgress => 1,
            FailureCategory::Preflight => 7,
            FailureCategory::ConfirmationRefused => 3,
            FailureCategory::ServiceStop => 4,
            FailureCategory::Migration => 5,
            FailureCategory::RoleFlip => 6,
            FailureCategory::Cancelled => 130,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("another promotion is in progress: {0}")]
    InProgress(#[source] LockError),
    #[error("preflight checks failed: {summary}")]
    Preflight { summary: String },
    #[error("operator refused in {state}: {question}")]
    ConfirmationRefused {
        state: PromotionState,
        question: Question,
    },
    #[error("no answer in {state}: {source}")]
    Confirmation {
        state: PromotionState,
        #[source]
        source: ConfirmationError,
    },
    #[error("promotion cancelled in {state}")]
    Cancelled { state: PromotionState },
    #[error("{state}: {source}")]
    ServiceStop {
        state: PromotionState,
        #[source]
        source: ServiceError,
    },
    #[error("{state}: task {task}: {source}")]
    Migration {
        state: PromotionState,
        task: String,
        #[source]
        source: MigrationError,
    },
    #[error("{state}: {source}")]
    RoleFlip {
        state: PromotionState,
        #[source]
        source: RoleError,
    },
    #[error("illegal transition {from} -> {to}")]
    InvalidTransition {
        from: PromotionState,
        to: PromotionState,
    },
}

impl PromotionError {
    pub fn category(&self) -> FailureCategory {
        match self {
            PromotionError::InProgress(_) => FailureCategory::InProgress,
            PromotionError::Preflight { .. } => FailureCategory::Preflight,
            PromotionError::ConfirmationRefused { .. } | PromotionError::Confirmation { .. } => {
                FailureCategory::ConfirmationRefused
            }
            PromotionError::Cancelled { .. } => FailureCategory::Cancelled,
            PromotionError::ServiceStop { .. } => FailureCategory::ServiceStop,
            PromotionError::Migration { .. } => FailureCategory::Migration,
            PromotionError::RoleFlip { .. } => FailureCategory::RoleFlip,
            PromotionError::InvalidTransition { .. } => FailureCategory::Configuration,
        }
    }
}

#[derive(Debug)]
pub struct PromotionReport {
    pub attempt_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: PromotionState,
    pub last_completed: Option<PromotionState>,
    /// Every state entered, in order, starting with `IDLE`.
    pub visited: Vec<PromotionState>,
    pub warnings: Vec<String>,
    pub error: Option<PromotionError>,
}

impl PromotionReport {
    pub fn succeeded(&self) -> bool {
        self.final_state == PromotionState::Done
    }

    pub fn category(&self) -> Option<FailureCategory> {
        self.error.as_ref().map(PromotionError::category)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            return 0;
        }
        self.category().map(|c| c.exit_code()).unwrap_or(1)
    }

    pub fn entered(&self, state: PromotionState) -> bool {
        self.visited.contains(&state)
    }
}

/// Collaborators of one orchestrator.
pub struct PromotionParts {
    pub locks: LockRegistry,
    pub preflight: PreflightSuite,
    pub confirmations: Arc<dyn ConfirmationProvider>,
    pub services: ServiceDependencyController,
    pub migrations: Arc<MigrationRunner>,
    pub migration_task: String,
    pub migration_log_prefix: String,
    pub role: Arc<dyn RoleFlipper>,
    pub keys: Arc<dyn KeyCleaner>,
    pub slots: SlotRegistry,
    pub audit: Arc<AuditTrail>,
}

pub struct PromotionOrchestrator {
    parts: PromotionParts,
}

/// Bookkeeping for the attempt in flight.
struct Attempt {
    id: Uuid,
    started_at: DateTime<Utc>,
    state: PromotionState,
    last_completed: Option<PromotionState>,
    visited: Vec<PromotionState>,
    warnings: Vec<String>,
    audit: Arc<AuditTrail>,
}

impl Attempt {
    fn new(audit: Arc<AuditTrail>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: PromotionState::Idle,
            last_completed: None,
            visited: vec![PromotionState::Idle],
            warnings: Vec::new(),
            audit,
        }
    }

    fn enter(&mut self, next: PromotionState) -> Result<(), PromotionError> {
        if !self.state.can_transition_to(next) {
            return Err(PromotionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.last_completed = Some(self.state);
        self.state = next;
        self.visited.push(next);
        info!(attempt = %self.id, state = %next, "promotion state entered");
        self.audit.record(
            Some(self.id),
            next.as_str(),
            AuditTransition::StateEntered,
            "",
            true,
        );
        Ok(())
    }

    fn warn(&mut self, message: String) {
        warn!(attempt = %self.id, state = %self.state, "{}", message);
        self.warnings.push(message);
    }

    fn finish(self, error: Option<PromotionError>) -> PromotionReport {
        let final_state = match &error {
            None => self.state,
            Some(e) => {
                error!(
                    attempt = %self.id,
                    state = %self.state,
                    category = %e.category(),
                    error = %e,
                    "promotion failed"
                );
                self.audit.record(
                    Some(self.id),
                    PromotionState::Failed.as_str(),
                    AuditTransition::StateEntered,
                    &e.to_string(),
                    false,
                );
                PromotionState::Failed
            }
        };
        let mut visited = self.visited;
        if final_state == PromotionState::Failed {
            visited.push(PromotionState::Failed);
        }
        PromotionReport {
            attempt_id: self.id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            final_state,
            last_completed: self.last_completed,
            visited,
            warnings: self.warnings,
            error,
        }
    }
}

impl PromotionOrchestrator {
    pub fn new(parts: PromotionParts) -> Self {
        Self { parts }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(
        config: &GeoConfig,
        confirmations: Arc<dyn ConfirmationProvider>,
        audit: Arc<AuditTrail>,
    ) -> anyhow::Result<Self> {
        let locks = LockRegistry::new(&config.lock_dir);
        let locator = Arc::new(PrimaryLocator::new(config.registry.clone()));
        let supervisor = Arc::new(CommandSupervisor::new(
            config.services.control_command.clone(),
            config.services.status_verb.clone(),
        ));
        let services = ServiceDependencyController::new(
            &config.services.dependent,
            supervisor,
            Duration::from_secs(config.services.timeout_secs),
            audit.clone(),
        )?;
        let slots = SlotRegistry::open(&config.replication.slot_registry).with_context(|| {
            format!(
                "opening slot registry {}",
                config.replication.slot_registry.display()
            )
        })?;

        Ok(Self::new(PromotionParts {
            preflight: PreflightSuite::from_config(config, locator),
            confirmations,
            services,
            migrations: Arc::new(MigrationRunner::from_config(
                &config.migration,
                locks.clone(),
                audit.clone(),
            )),
            migration_task: config.migration.task.clone(),
            migration_log_prefix: config.migration.log_prefix.clone(),
            role: Arc::new(LocalRoleFlipper::new(config.node.clone())),
            keys: Arc::new(FsKeyCleaner::new(config.keys.stale_key_paths.clone())),
            slots,
            audit,
            locks,
        }))
    }

    pub fn services(&self) -> &ServiceDependencyController {
        &self.parts.services
    }

    pub fn migrations(&self) -> &MigrationRunner {
        &self.parts.migrations
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.parts.slots
    }

    /// Run one promotion attempt to a terminal state.
    pub async fn promote(
        &mut self,
        request: PromotionRequest,
        cancel: &CancellationToken,
    ) -> PromotionReport {
        let mut attempt = Attempt::new(self.parts.audit.clone());
        info!(attempt = %attempt.id, ?request, "starting promotion");

        let _guard = match self.parts.locks.try_acquire(PROMOTION_LOCK) {
            Ok(guard) => guard,
            Err(e) => return attempt.finish(Some(PromotionError::InProgress(e))),
        };
        self.parts.services.set_attempt(attempt.id);

        match self.drive(request, cancel, &mut attempt).await {
            Ok(()) => {
                info!(
                    attempt = %attempt.id,
                    warnings = attempt.warnings.len(),
                    "promotion complete"
                );
                attempt.finish(None)
            }
            Err(e) => attempt.finish(Some(e)),
        }
    }

    async fn drive(
        &mut self,
        request: PromotionRequest,
        cancel: &CancellationToken,
        attempt: &mut Attempt,
    ) -> Result<(), PromotionError> {
        let skip_preflight = match request.skip_preflight_checks {
            Some(skip) => skip,
            None => {
                let ask = self.ask(Question::SkipPreflightChecks, attempt.state);
                cancellable(cancel, attempt.state, ask).await?
            }
        };

        if skip_preflight {
            warn!(attempt = %attempt.id, "preflight checks skipped");
        } else {
            attempt.enter(PromotionState::Preflight)?;
            let report = cancellable(cancel, attempt.state, async {
                Ok(self.parts.preflight.run().await)
            })
            .await?;
            if !report.passed() {
                return Err(PromotionError::Preflight {
                    summary: report.summary(),
                });
            }
        }

        attempt.enter(PromotionState::AwaitConfirmPrimaryDown)?;
        let primary_down = match request.confirm_primary_down {
            Some(confirmed) => confirmed,
            None => {
                let ask = self.ask(Question::PrimaryIsDown, attempt.state);
                cancellable(cancel, attempt.state, ask).await?
            }
        };
        if !primary_down {
            return Err(PromotionError::ConfirmationRefused {
                state: attempt.state,
                question: Question::PrimaryIsDown,
            });
        }
        if cancel.is_cancelled() {
            return Err(PromotionError::Cancelled {
                state: attempt.state,
            });
        }

        // Past this point the cluster is mid-transition and cancellation is ignored.
        attempt.enter(PromotionState::QuiesceServices)?;
        self.parts
            .services
            .quiesce()
            .await
            .map_err(|source| PromotionError::ServiceStop {
                state: PromotionState::QuiesceServices,
                source,
            })?;

        attempt.enter(PromotionState::RunMigrations)?;
        let task = self.parts.migration_task.clone();
        self.parts
            .migrations
            .run(&task, &self.parts.migration_log_prefix, Some(attempt.id))
            .await
            .map_err(|source| PromotionError::Migration {
                state: PromotionState::RunMigrations,
                task: task.clone(),
                source,
            })?;

        attempt.enter(PromotionState::FlipRole)?;
        let node = self
            .parts
            .role
            .promote()
            .await
            .map_err(|source| PromotionError::RoleFlip {
                state: PromotionState::FlipRole,
                source,
            })?;
        self.parts.audit.record(
            Some(attempt.id),
            &node.id,
            AuditTransition::RoleFlipped,
            "PRIMARY",
            true,
        );
        match self.parts.slots.clear() {
            Ok(0) => {}
            Ok(n) => info!(attempt = %attempt.id, slots = n, "cleared local replication slots"),
            Err(e) => attempt.warn(format!("could not clear local replication slots: {}", e)),
        }

        attempt.enter(PromotionState::RemoveStaleKeys)?;
        let remove_keys = match request.confirm_removing_keys {
            Some(confirmed) => confirmed,
            None => match self.ask(Question::RemoveStaleKeys, attempt.state).await {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    attempt.warn(format!("{}", e));
                    false
                }
            },
        };
        if remove_keys {
            let cleanup = self.parts.keys.remove_stale_keys().await;
            for path in &cleanup.removed {
                self.parts.audit.record(
                    Some(attempt.id),
                    &path.display().to_string(),
                    AuditTransition::KeyRemoved,
                    "",
                    true,
                );
            }
            for (path, reason) in &cleanup.failed {
                self.parts.audit.record(
                    Some(attempt.id),
                    &path.display().to_string(),
                    AuditTransition::KeyRemoved,
                    reason,
                    false,
                );
                attempt.warn(format!(
                    "could not remove stale key {}: {}",
                    path.display(),
                    reason
                ));
            }
        } else {
            attempt.warn(
                "stale key removal was not confirmed; credential cleanup is outstanding"
                    .to_string(),
            );
        }

        attempt.enter(PromotionState::ResumeServices)?;
        if let Err(e) = self.parts.services.resume().await {
            attempt.warn(format!("services not fully resumed: {}", e));
        }

        attempt.enter(PromotionState::Done)?;
        Ok(())
    }

    async fn ask(&self, question: Question, state: PromotionState) -> Result<bool, PromotionError> {
        self.parts
            .confirmations
            .confirm(question)
            .await
            .map_err(|source| PromotionError::Confirmation { state, source })
    }
}

async fn cancellable<T, F>(
    cancel: &CancellationToken,
    state: PromotionState,
    work: F,
) -> Result<T, PromotionError>
where
    F: Future<Output = Result<T, PromotionError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PromotionError::Cancelled { state }),
        result = work => result,
    }
}

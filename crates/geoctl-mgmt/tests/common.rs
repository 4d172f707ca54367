#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use geoctl_mgmt::config::ServiceSpec;
use geoctl_mgmt::keys::KeyCleanup;
use geoctl_mgmt::migration::{ExecStatus, MigrationExecutor};
use geoctl_mgmt::preflight::{PreflightCheck, PreflightError};
use geoctl_mgmt::role::RoleError;
use geoctl_mgmt::services::SupervisorError;
use geoctl_mgmt::{
    AuditTrail, ClusterNode, ConfirmationProvider, KeyCleaner, LockRegistry, MigrationRunner,
    NodeRole, PreflightSuite, PromotionOrchestrator, PromotionParts, RoleFlipper,
    ServiceDependencyController, ServiceSupervisor,
};
use geoctl_repl::SlotRegistry;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Shared, ordered record of every side effect the fakes perform.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct FakeSupervisor {
    pub running: Mutex<HashSet<String>>,
    pub fail_stop: HashSet<String>,
    pub fail_start: HashSet<String>,
    /// Cancelled on every stop call, to simulate an interrupt mid-transition.
    pub cancel_on_stop: Option<CancellationToken>,
    pub journal: Journal,
}

impl FakeSupervisor {
    pub fn new(running: &[&str], journal: Journal) -> Self {
        Self {
            running: Mutex::new(running.iter().map(|s| s.to_string()).collect()),
            fail_stop: HashSet::new(),
            fail_start: HashSet::new(),
            cancel_on_stop: None,
            journal,
        }
    }

    pub fn is_up(&self, service: &str) -> bool {
        self.running.lock().unwrap().contains(service)
    }
}

#[async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn is_running(&self, service: &str) -> Result<bool, SupervisorError> {
        Ok(self.is_up(service))
    }

    async fn stop(&self, service: &str) -> Result<(), SupervisorError> {
        self.journal.push(format!("stop {}", service));
        if let Some(cancel) = &self.cancel_on_stop {
            cancel.cancel();
        }
        if self.fail_stop.contains(service) {
            return Err(SupervisorError::Command {
                command: format!("systemctl stop {}", service),
                status: "exit status: 1".to_string(),
                stderr: "unit refused to stop".to_string(),
            });
        }
        self.running.lock().unwrap().remove(service);
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<(), SupervisorError> {
        self.journal.push(format!("start {}", service));
        if self.fail_start.contains(service) {
            return Err(SupervisorError::Command {
                command: format!("systemctl start {}", service),
                status: "exit status: 1".to_string(),
                stderr: "unit failed to start".to_string(),
            });
        }
        self.running.lock().unwrap().insert(service.to_string());
        Ok(())
    }
}

pub struct FakeMigration {
    pub success: bool,
    pub journal: Journal,
}

#[async_trait]
impl MigrationExecutor for FakeMigration {
    async fn execute(&self, task: &str, log_path: &Path) -> std::io::Result<ExecStatus> {
        self.journal.push(format!("migrate {}", task));
        std::fs::write(log_path, "== migrating ==\n")?;
        Ok(ExecStatus {
            success: self.success,
            description: if self.success { "exit status: 0" } else { "exit status: 1" }.to_string(),
        })
    }
}

pub struct FakeRole {
    pub fail: bool,
    pub role: Mutex<NodeRole>,
    pub journal: Journal,
}

impl FakeRole {
    pub fn current_role(&self) -> NodeRole {
        *self.role.lock().unwrap()
    }

    fn node(&self) -> ClusterNode {
        ClusterNode {
            id: "geo-2".to_string(),
            role: self.current_role(),
            service_address: "10.0.0.2:5432".to_string(),
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl RoleFlipper for FakeRole {
    async fn current(&self) -> Result<ClusterNode, RoleError> {
        Ok(self.node())
    }

    async fn promote(&self) -> Result<ClusterNode, RoleError> {
        self.journal.push("flip");
        if self.fail {
            return Err(RoleError::PromoteCommand {
                status: "exit status: 1".to_string(),
                stderr: "promote refused".to_string(),
            });
        }
        *self.role.lock().unwrap() = NodeRole::Primary;
        Ok(self.node())
    }
}

pub struct FakeKeys {
    pub keys: Vec<PathBuf>,
    /// Report every key as not removable.
    pub fail: bool,
    pub journal: Journal,
}

#[async_trait]
impl KeyCleaner for FakeKeys {
    async fn remove_stale_keys(&self) -> KeyCleanup {
        self.journal.push("remove keys");
        if self.fail {
            return KeyCleanup {
                failed: self
                    .keys
                    .iter()
                    .map(|k| (k.clone(), "Permission denied (os error 13)".to_string()))
                    .collect(),
                ..KeyCleanup::default()
            };
        }
        KeyCleanup {
            removed: self.keys.clone(),
            ..KeyCleanup::default()
        }
    }
}

pub struct FixedCheck {
    pub pass: bool,
    pub journal: Journal,
}

#[async_trait]
impl PreflightCheck for FixedCheck {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn run(&self) -> Result<String, PreflightError> {
        self.journal.push("preflight");
        if self.pass {
            Ok("ok".to_string())
        } else {
            Err(PreflightError::LagTooHigh {
                lag_secs: 300.0,
                max_secs: 60,
            })
        }
    }
}

/// Knobs for [`harness`].
pub struct Scenario {
    pub services: Vec<&'static str>,
    pub running: Vec<&'static str>,
    pub fail_stop: Vec<&'static str>,
    pub fail_start: Vec<&'static str>,
    pub cancel_on_stop: Option<CancellationToken>,
    pub preflight_passes: bool,
    pub migration_succeeds: bool,
    pub flip_fails: bool,
    pub keys_fail: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            services: vec!["puma", "sidekiq", "geo-logcursor", "nginx"],
            running: vec!["puma", "sidekiq", "geo-logcursor", "nginx"],
            fail_stop: Vec::new(),
            fail_start: Vec::new(),
            cancel_on_stop: None,
            preflight_passes: true,
            migration_succeeds: true,
            flip_fails: false,
            keys_fail: false,
        }
    }
}

pub struct Harness {
    pub orchestrator: PromotionOrchestrator,
    pub journal: Journal,
    pub supervisor: Arc<FakeSupervisor>,
    pub role: Arc<FakeRole>,
    pub audit: Arc<AuditTrail>,
    pub locks: LockRegistry,
    pub dir: TempDir,
}

pub fn harness(scenario: Scenario, confirmations: Arc<dyn ConfirmationProvider>) -> Harness {
    let dir = TempDir::new().unwrap();
    let journal = Journal::default();
    let audit = Arc::new(AuditTrail::new());
    let locks = LockRegistry::new(dir.path().join("locks"));

    let mut supervisor = FakeSupervisor::new(&scenario.running, journal.clone());
    supervisor.fail_stop = scenario.fail_stop.iter().map(|s| s.to_string()).collect();
    supervisor.fail_start = scenario.fail_start.iter().map(|s| s.to_string()).collect();
    supervisor.cancel_on_stop = scenario.cancel_on_stop.clone();
    let supervisor = Arc::new(supervisor);

    let specs: Vec<ServiceSpec> = scenario
        .services
        .iter()
        .enumerate()
        .map(|(i, name)| ServiceSpec {
            name: name.to_string(),
            start_order: i as u32 + 1,
        })
        .collect();
    let services = ServiceDependencyController::new(
        &specs,
        supervisor.clone(),
        Duration::from_secs(5),
        audit.clone(),
    )
    .unwrap();

    let migrations = Arc::new(MigrationRunner::new(
        dir.path().join("logs"),
        Arc::new(FakeMigration {
            success: scenario.migration_succeeds,
            journal: journal.clone(),
        }),
        locks.clone(),
        audit.clone(),
    ));

    let role = Arc::new(FakeRole {
        fail: scenario.flip_fails,
        role: Mutex::new(NodeRole::Secondary),
        journal: journal.clone(),
    });

    let mut slots = SlotRegistry::open(dir.path().join("slots.json")).unwrap();
    slots
        .begin(geoctl_repl::ReplicationSlot::pending(
            "geo_1",
            "10.0.0.1",
            5432,
            geoctl_repl::SslMode::VerifyFull,
        ))
        .unwrap();
    slots.mark_active("geo_1").unwrap();

    let orchestrator = PromotionOrchestrator::new(PromotionParts {
        locks: locks.clone(),
        preflight: PreflightSuite::new().with(FixedCheck {
            pass: scenario.preflight_passes,
            journal: journal.clone(),
        }),
        confirmations,
        services,
        migrations,
        migration_task: "geo:db:migrate".to_string(),
        migration_log_prefix: "geo-promotion-db-migrate".to_string(),
        role: role.clone(),
        keys: Arc::new(FakeKeys {
            keys: vec![PathBuf::from("/var/opt/geo/.ssh/id_rsa")],
            fail: scenario.keys_fail,
            journal: journal.clone(),
        }),
        slots,
        audit: audit.clone(),
    });

    Harness {
        orchestrator,
        journal,
        supervisor,
        role,
        audit,
        locks,
        dir,
    }
}

//! Non-destructive checks run before a promotion touches anything.

use async_trait::async_trait;
use geoctl_repl::{PrimaryCandidate, PrimaryLocator, ReplError};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::GeoConfig;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("cannot connect to {address}: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("replication lag {lag_secs:.1}s exceeds {max_secs}s")]
    LagTooHigh { lag_secs: f64, max_secs: u64 },
    #[error("replication lag probe failed: {0}")]
    LagProbe(String),
    #[error("another primary is still registered at {0}")]
    PrimaryStillRegistered(PrimaryCandidate),
    #[error("registry lookup failed: {0}")]
    Registry(#[source] ReplError),
}

#[async_trait]
pub trait PreflightCheck: Send + Sync {
    fn name(&self) -> &str;
    /// Returns a short human readable result on success.
    async fn run(&self) -> Result<String, PreflightError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn summary(&self) -> String {
        self.failures()
            .iter()
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// The local database accepts TCP connections.
pub struct ConnectivityCheck {
    address: String,
    timeout: Duration,
}

impl ConnectivityCheck {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PreflightCheck for ConnectivityCheck {
    fn name(&self) -> &str {
        "connectivity"
    }

    async fn run(&self) -> Result<String, PreflightError> {
        let unreachable = |reason: String| PreflightError::Unreachable {
            address: self.address.clone(),
            reason,
        };
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Ok(format!("{} is accepting connections", self.address)),
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!("timed out after {:?}", self.timeout))),
        }
    }
}

/// Runs a probe command that prints the replication lag in seconds.
pub struct ReplicationLagCheck {
    command: Vec<String>,
    max_lag_secs: u64,
}

impl ReplicationLagCheck {
    pub fn new(command: Vec<String>, max_lag_secs: u64) -> Self {
        Self {
            command,
            max_lag_secs,
        }
    }
}

#[async_trait]
impl PreflightCheck for ReplicationLagCheck {
    fn name(&self) -> &str {
        "replication_lag"
    }

    async fn run(&self) -> Result<String, PreflightError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PreflightError::LagProbe("no probe command configured".to_string()))?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PreflightError::LagProbe(e.to_string()))?;
        if !output.status.success() {
            return Err(PreflightError::LagProbe(format!(
                "probe exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lag_secs: f64 = stdout.trim().parse().map_err(|_| {
            PreflightError::LagProbe(format!("unparseable lag value {:?}", stdout.trim()))
        })?;
        if lag_secs > self.max_lag_secs as f64 {
            return Err(PreflightError::LagTooHigh {
                lag_secs,
                max_secs: self.max_lag_secs,
            });
        }
        Ok(format!("replication lag {:.1}s", lag_secs))
    }
}

/// Fails while the registry still advertises a primary other than this node.
pub struct RegistryPrimaryCheck {
    locator: Arc<PrimaryLocator>,
    local: Option<SocketAddr>,
}

impl RegistryPrimaryCheck {
    pub fn new(locator: Arc<PrimaryLocator>, local_address: &str) -> Self {
        Self {
            locator,
            local: local_address.parse().ok(),
        }
    }
}

#[async_trait]
impl PreflightCheck for RegistryPrimaryCheck {
    fn name(&self) -> &str {
        "registry_primary"
    }

    async fn run(&self) -> Result<String, PreflightError> {
        match self.locator.resolve_configured().await {
            Ok(candidates) => {
                match candidates
                    .into_iter()
                    .find(|c| Some(c.socket_addr()) != self.local)
                {
                    Some(other) => Err(PreflightError::PrimaryStillRegistered(other)),
                    None => Ok("this node is the only registered primary".to_string()),
                }
            }
            Err(ReplError::NotFound { query }) => Ok(format!("no primary registered for {}", query)),
            Err(e) => Err(PreflightError::Registry(e)),
        }
    }
}

/// Ordered set of checks; every check runs even after a failure.
#[derive(Default)]
pub struct PreflightSuite {
    checks: Vec<Box<dyn PreflightCheck>>,
}

impl PreflightSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &GeoConfig, locator: Arc<PrimaryLocator>) -> Self {
        let mut suite = Self::new().with(ConnectivityCheck::new(
            config.node.service_address.clone(),
            Duration::from_secs(config.preflight.connect_timeout_secs),
        ));
        if !config.preflight.lag_command.is_empty() {
            suite = suite.with(ReplicationLagCheck::new(
                config.preflight.lag_command.clone(),
                config.preflight.max_replication_lag_secs,
            ));
        }
        let registry = locator.settings();
        if config.preflight.check_registry_primary
            && registry.enabled
            && registry.service_name.is_some()
        {
            suite = suite.with(RegistryPrimaryCheck::new(
                locator,
                &config.node.service_address,
            ));
        } else {
            debug!("registry primary check disabled");
        }
        suite
    }

    pub fn with(mut self, check: impl PreflightCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub async fn run(&self) -> PreflightReport {
        let mut report = PreflightReport::default();
        for check in &self.checks {
            let started = Instant::now();
            let result = check.run().await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let (passed, message) = match result {
                Ok(message) => {
                    info!(check = %check.name(), %message, "preflight check passed");
                    (true, message)
                }
                Err(e) => {
                    warn!(check = %check.name(), error = %e, "preflight check failed");
                    (false, e.to_string())
                }
            };
            report.checks.push(CheckResult {
                name: check.name().to_string(),
                passed,
                message,
                duration_ms,
            });
        }
        report
    }
}

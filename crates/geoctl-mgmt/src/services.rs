//! Ordered stop/start of the application services that depend on the local
//! database.
//!
//! Services are declared with a start order. Stopping walks that order
//! backwards and starting walks it forwards, so a service is never running
//! while something started before it is stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit_trail::{AuditTrail, AuditTransition};
use crate::config::ServiceSpec;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid dependent service configuration: {0}")]
    Configuration(String),
    #[error("failed to stop {service}: {reason} (stopped: {stopped:?}, still running: {still_running:?})")]
    StopFailed {
        service: String,
        reason: String,
        stopped: Vec<String>,
        still_running: Vec<String>,
    },
    #[error("failed to start {service}: {reason} (started: {started:?}, still stopped: {still_stopped:?})")]
    StartFailed {
        service: String,
        reason: String,
        started: Vec<String>,
        still_stopped: Vec<String>,
    },
}

impl ServiceError {
    pub fn service(&self) -> Option<&str> {
        match self {
            ServiceError::Configuration(_) => None,
            ServiceError::StopFailed { service, .. } | ServiceError::StartFailed { service, .. } => {
                Some(service)
            }
        }
    }
}

/// Process supervision capability.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn is_running(&self, service: &str) -> Result<bool, SupervisorError>;
    /// Returns once the supervisor reports the service down.
    async fn stop(&self, service: &str) -> Result<(), SupervisorError>;
    /// Returns once the supervisor reports the service up.
    async fn start(&self, service: &str) -> Result<(), SupervisorError>;
}

/// Drives a service manager CLI: `<control...> stop|start|<status_verb> <service>`.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    control: Vec<String>,
    status_verb: String,
}

impl CommandSupervisor {
    pub fn new(control: Vec<String>, status_verb: impl Into<String>) -> Self {
        Self {
            control,
            status_verb: status_verb.into(),
        }
    }

    async fn run(&self, verb: &str, service: &str) -> Result<std::process::Output, SupervisorError> {
        let (program, base) = self.control.split_first().ok_or_else(|| SupervisorError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty control command"),
        })?;
        let rendered = format!("{} {} {}", self.control.join(" "), verb, service);
        debug!(command = %rendered, "running service control command");
        Command::new(program)
            .args(base)
            .arg(verb)
            .arg(service)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                command: rendered,
                source,
            })
    }

    async fn run_checked(&self, verb: &str, service: &str) -> Result<(), SupervisorError> {
        let output = self.run(verb, service).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(SupervisorError::Command {
            command: format!("{} {} {}", self.control.join(" "), verb, service),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ServiceSupervisor for CommandSupervisor {
    async fn is_running(&self, service: &str) -> Result<bool, SupervisorError> {
        let output = self.run(&self.status_verb, service).await?;
        Ok(output.status.success())
    }

    async fn stop(&self, service: &str) -> Result<(), SupervisorError> {
        self.run_checked("stop", service).await
    }

    async fn start(&self, service: &str) -> Result<(), SupervisorError> {
        self.run_checked("start", service).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentService {
    pub name: String,
    pub running: bool,
    /// 1-based position in the stop sequence.
    pub stop_order: u32,
    pub start_order: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuiesceReport {
    /// In stop order.
    pub stopped: Vec<String>,
    pub already_stopped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// In start order.
    pub started: Vec<String>,
}

pub struct ServiceDependencyController {
    services: Vec<DependentService>,
    supervisor: Arc<dyn ServiceSupervisor>,
    timeout: Duration,
    audit: Arc<AuditTrail>,
    attempt: Option<Uuid>,
    quiesced: Vec<String>,
}

impl ServiceDependencyController {
    pub fn new(
        specs: &[ServiceSpec],
        supervisor: Arc<dyn ServiceSupervisor>,
        timeout: Duration,
        audit: Arc<AuditTrail>,
    ) -> Result<Self, ServiceError> {
        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for spec in specs {
            if spec.name.trim().is_empty() {
                return Err(ServiceError::Configuration("empty service name".to_string()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ServiceError::Configuration(format!(
                    "service {} declared twice",
                    spec.name
                )));
            }
            if !orders.insert(spec.start_order) {
                return Err(ServiceError::Configuration(format!(
                    "start order {} used by more than one service",
                    spec.start_order
                )));
            }
        }

        let mut sorted: Vec<&ServiceSpec> = specs.iter().collect();
        sorted.sort_by_key(|s| s.start_order);
        let total = sorted.len() as u32;
        let services = sorted
            .into_iter()
            .enumerate()
            .map(|(i, spec)| DependentService {
                name: spec.name.clone(),
                running: false,
                stop_order: total - i as u32,
                start_order: spec.start_order,
            })
            .collect();

        Ok(Self {
            services,
            supervisor,
            timeout,
            audit,
            attempt: None,
            quiesced: Vec::new(),
        })
    }

    /// Tag audit events with a promotion attempt.
    pub fn set_attempt(&mut self, attempt: Uuid) {
        self.attempt = Some(attempt);
    }

    /// Services in start order.
    pub fn services(&self) -> &[DependentService] {
        &self.services
    }

    pub fn running(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.running)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Services stopped by the last quiesce and not yet resumed, in stop order.
    pub fn quiesced(&self) -> &[String] {
        &self.quiesced
    }

    /// Ask the supervisor which services are up. A failed status query counts as running.
    pub async fn refresh(&mut self) {
        for svc in &mut self.services {
            svc.running = match self.supervisor.is_running(&svc.name).await {
                Ok(running) => running,
                Err(e) => {
                    debug!(service = %svc.name, error = %e, "status query failed, assuming running");
                    true
                }
            };
        }
    }

    /// Stop running services in reverse start order. Stops at the first failure.
    pub async fn quiesce(&mut self) -> Result<QuiesceReport, ServiceError> {
        self.refresh().await;
        let mut report = QuiesceReport::default();

        for idx in (0..self.services.len()).rev() {
            let name = self.services[idx].name.clone();
            if !self.services[idx].running {
                debug!(service = %name, "already stopped");
                report.already_stopped.push(name);
                continue;
            }

            self.emit(&name, AuditTransition::Stopping, "", true);
            match self.bounded(self.supervisor.stop(&name)).await {
                Ok(()) => {
                    self.services[idx].running = false;
                    self.quiesced.push(name.clone());
                    self.emit(&name, AuditTransition::Stopped, "", true);
                    report.stopped.push(name);
                }
                Err(reason) => {
                    self.emit(&name, AuditTransition::StopFailed, &reason, false);
                    return Err(ServiceError::StopFailed {
                        service: name,
                        reason,
                        stopped: report.stopped,
                        still_running: self.running(),
                    });
                }
            }
        }

        info!(stopped = report.stopped.len(), "dependent services quiesced");
        Ok(report)
    }

    /// Start, in start order, the services the last quiesce stopped.
    pub async fn resume(&mut self) -> Result<ResumeReport, ServiceError> {
        let mut report = ResumeReport::default();

        for idx in 0..self.services.len() {
            let name = self.services[idx].name.clone();
            if !self.quiesced.contains(&name) {
                continue;
            }

            self.emit(&name, AuditTransition::Starting, "", true);
            match self.bounded(self.supervisor.start(&name)).await {
                Ok(()) => {
                    self.services[idx].running = true;
                    self.quiesced.retain(|n| n != &name);
                    self.emit(&name, AuditTransition::Started, "", true);
                    report.started.push(name);
                }
                Err(reason) => {
                    self.emit(&name, AuditTransition::StartFailed, &reason, false);
                    let still_stopped = self
                        .services
                        .iter()
                        .filter(|s| self.quiesced.contains(&s.name))
                        .map(|s| s.name.clone())
                        .collect();
                    return Err(ServiceError::StartFailed {
                        service: name,
                        reason,
                        started: report.started,
                        still_stopped,
                    });
                }
            }
        }

        info!(started = report.started.len(), "dependent services resumed");
        Ok(report)
    }

    async fn bounded<F>(&self, ack: F) -> Result<(), String>
    where
        F: std::future::Future<Output = Result<(), SupervisorError>>,
    {
        match tokio::time::timeout(self.timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no acknowledgement within {:?}", self.timeout)),
        }
    }

    fn emit(&self, service: &str, transition: AuditTransition, detail: &str, success: bool) {
        self.audit
            .record(self.attempt, service, transition, detail, success);
    }
}

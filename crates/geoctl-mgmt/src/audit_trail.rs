use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

const MAX_EVENTS: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTransition {
    Stopping,
    Stopped,
    StopFailed,
    Starting,
    Started,
    StartFailed,
    StateEntered,
    MigrationStarted,
    MigrationFinished,
    RoleFlipped,
    KeyRemoved,
}

impl AuditTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditTransition::Stopping => "stopping",
            AuditTransition::Stopped => "stopped",
            AuditTransition::StopFailed => "stop_failed",
            AuditTransition::Starting => "starting",
            AuditTransition::Started => "started",
            AuditTransition::StartFailed => "start_failed",
            AuditTransition::StateEntered => "state_entered",
            AuditTransition::MigrationStarted => "migration_started",
            AuditTransition::MigrationFinished => "migration_finished",
            AuditTransition::RoleFlipped => "role_flipped",
            AuditTransition::KeyRemoved => "key_removed",
        }
    }
}

impl fmt::Display for AuditTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub attempt: Option<Uuid>,
    /// Service, state, task or path the event is about.
    pub subject: String,
    pub transition: AuditTransition,
    pub detail: String,
    pub success: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub subject: Option<String>,
    pub transition: Option<AuditTransition>,
    pub attempt: Option<Uuid>,
    pub failures_only: bool,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref s) = self.subject {
            if &event.subject != s {
                return false;
            }
        }
        if let Some(t) = self.transition {
            if event.transition != t {
                return false;
            }
        }
        if let Some(a) = self.attempt {
            if event.attempt != Some(a) {
                return false;
            }
        }
        if self.failures_only && event.success {
            return false;
        }
        true
    }
}

pub struct AuditTrail {
    events: Mutex<VecDeque<AuditEvent>>,
    next_id: Mutex<u64>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(64)),
            next_id: Mutex::new(1),
        }
    }

    pub fn record(
        &self,
        attempt: Option<Uuid>,
        subject: &str,
        transition: AuditTransition,
        detail: &str,
        success: bool,
    ) -> u64 {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            let id = *next;
            *next += 1;
            id
        };

        let event = AuditEvent {
            id,
            timestamp: Utc::now(),
            attempt,
            subject: subject.to_string(),
            transition,
            detail: detail.to_string(),
            success,
        };

        if success {
            tracing::info!(
                target: "geoctl::audit",
                subject = %event.subject,
                transition = %event.transition,
                timestamp = %event.timestamp,
                detail = %event.detail,
                "audit"
            );
        } else {
            tracing::warn!(
                target: "geoctl::audit",
                subject = %event.subject,
                transition = %event.transition,
                timestamp = %event.timestamp,
                detail = %event.detail,
                "audit"
            );
        }

        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
        id
    }

    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().filter(|e| filter.matches(e)).cloned().collect()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.query(&AuditFilter::new())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.events())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_assigns_increasing_ids() {
        let trail = AuditTrail::new();
        let a = trail.record(None, "puma", AuditTransition::Stopping, "", true);
        let b = trail.record(None, "puma", AuditTransition::Stopped, "", true);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn events_keep_insertion_order() {
        let trail = AuditTrail::new();
        trail.record(None, "sidekiq", AuditTransition::Stopped, "", true);
        trail.record(None, "puma", AuditTransition::Stopped, "", true);
        let subjects: Vec<_> = trail.events().into_iter().map(|e| e.subject).collect();
        assert_eq!(subjects, vec!["sidekiq", "puma"]);
    }

    #[test]
    fn filter_by_subject_and_transition() {
        let trail = AuditTrail::new();
        trail.record(None, "puma", AuditTransition::Stopping, "", true);
        trail.record(None, "puma", AuditTransition::Stopped, "", true);
        trail.record(None, "sidekiq", AuditTransition::Stopped, "", true);

        let filter = AuditFilter {
            subject: Some("puma".to_string()),
            transition: Some(AuditTransition::Stopped),
            ..AuditFilter::default()
        };
        assert_eq!(trail.query(&filter).len(), 1);
    }

    #[test]
    fn filter_failures_and_attempt() {
        let trail = AuditTrail::new();
        let attempt = Uuid::new_v4();
        trail.record(Some(attempt), "puma", AuditTransition::StopFailed, "timeout", false);
        trail.record(None, "sidekiq", AuditTransition::StopFailed, "exit 1", false);
        trail.record(Some(attempt), "nginx", AuditTransition::Stopped, "", true);

        let failures = AuditFilter {
            failures_only: true,
            ..AuditFilter::default()
        };
        assert_eq!(trail.query(&failures).len(), 2);

        let by_attempt = AuditFilter {
            attempt: Some(attempt),
            ..AuditFilter::default()
        };
        assert_eq!(trail.query(&by_attempt).len(), 2);
    }

    #[test]
    fn ring_is_bounded() {
        let trail = AuditTrail::new();
        for i in 0..(MAX_EVENTS + 5) {
            trail.record(None, &format!("svc{}", i), AuditTransition::Started, "", true);
        }
        assert_eq!(trail.len(), MAX_EVENTS);
        assert_eq!(trail.events()[0].subject, "svc5");
    }

    #[test]
    fn serializes_transition_names() {
        let trail = AuditTrail::new();
        trail.record(None, "puma", AuditTransition::StopFailed, "", false);
        let json = trail.to_json().unwrap();
        assert!(json.contains("\"stop_failed\""));
    }
}

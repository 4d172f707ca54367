//! Persisted registry of replication slots this node follows.
//!
//! The registry is the bookkeeping side of [`crate::bootstrap`]: every attach
//! records its slot here before any data moves, so an interrupted run can be
//! told apart from a healthy one on the next invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ReplError;
use crate::ssl_mode::SslMode;

/// Lifecycle of a replication slot on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    /// Base backup started but not yet finished.
    Pending,
    /// Backup finished and the node follows the source.
    Active,
    /// Backup failed or was interrupted.
    Failed,
}

/// A named handle on the primary tracking this secondary's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSlot {
    /// Slot name, unique per primary.
    pub name: String,
    /// Primary host the slot lives on.
    pub source_host: String,
    /// Primary database port.
    pub source_port: u16,
    /// Transport security used for the stream.
    pub ssl_mode: SslMode,
    /// Current state.
    pub state: SlotState,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Why the slot failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ReplicationSlot {
    /// Create a slot in the `Pending` state.
    pub fn pending(name: &str, source_host: &str, source_port: u16, ssl_mode: SslMode) -> Self {
        Self {
            name: name.to_string(),
            source_host: source_host.to_string(),
            source_port,
            ssl_mode,
            state: SlotState::Pending,
            updated_at: Utc::now(),
            failure_reason: None,
        }
    }

    /// Returns true if the slot is `Active`.
    pub fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }
}

/// Registry of slots keyed by name, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    path: Option<PathBuf>,
    slots: BTreeMap<String, ReplicationSlot>,
}

impl SlotRegistry {
    /// Create a registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the registry from `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ReplError> {
        let path = path.into();
        let slots = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), slots = slots.len(), "loaded slot registry");
        Ok(Self {
            path: Some(path),
            slots,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up a slot by name.
    pub fn get(&self, name: &str) -> Option<&ReplicationSlot> {
        self.slots.get(name)
    }

    /// All slots, ordered by name.
    pub fn slots(&self) -> impl Iterator<Item = &ReplicationSlot> {
        self.slots.values()
    }

    /// Number of tracked slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no slots are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Record a new attach attempt. Fails if a slot of that name is active.
    pub fn begin(&mut self, slot: ReplicationSlot) -> Result<(), ReplError> {
        if let Some(existing) = self.slots.get(&slot.name) {
            if existing.is_active() {
                return Err(ReplError::AlreadyAttached {
                    slot: existing.name.clone(),
                    host: existing.source_host.clone(),
                });
            }
        }
        let mut next = self.slots.clone();
        next.insert(slot.name.clone(), slot);
        self.commit(next)
    }

    /// Mark a slot active. Memory is left untouched if the write fails.
    pub fn mark_active(&mut self, name: &str) -> Result<(), ReplError> {
        self.transition(name, SlotState::Active, None)
    }

    /// Mark a slot failed with a reason.
    ///
    /// The failure is kept in memory even when it cannot be written, so a
    /// later attach in this process is not refused as already attached.
    pub fn mark_failed(&mut self, name: &str, reason: &str) -> Result<(), ReplError> {
        self.transition(name, SlotState::Failed, Some(reason.to_string()))
    }

    /// Destroy a slot record (repoint).
    pub fn remove(&mut self, name: &str) -> Result<Option<ReplicationSlot>, ReplError> {
        let mut next = self.slots.clone();
        let removed = next.remove(name);
        if removed.is_some() {
            self.commit(next)?;
            info!(slot = %name, "replication slot destroyed");
        }
        Ok(removed)
    }

    /// Destroy every slot record. Used once this node becomes primary.
    pub fn clear(&mut self) -> Result<usize, ReplError> {
        let count = self.slots.len();
        self.commit(BTreeMap::new())?;
        Ok(count)
    }

    fn transition(
        &mut self,
        name: &str,
        state: SlotState,
        reason: Option<String>,
    ) -> Result<(), ReplError> {
        let mut next = self.slots.clone();
        let slot = next
            .get_mut(name)
            .ok_or_else(|| ReplError::config(format!("unknown replication slot {}", name)))?;
        slot.state = state;
        slot.failure_reason = reason;
        slot.updated_at = Utc::now();

        let written = self.persist(&next);
        if written.is_ok() || state == SlotState::Failed {
            self.slots = next;
            debug!(slot = %name, state = ?state, "slot state changed");
        }
        written
    }

    /// Write `next` and adopt it only once it is on disk.
    fn commit(&mut self, next: BTreeMap<String, ReplicationSlot>) -> Result<(), ReplError> {
        self.persist(&next)?;
        self.slots = next;
        Ok(())
    }

    fn persist(&self, slots: &BTreeMap<String, ReplicationSlot>) -> Result<(), ReplError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(slots)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

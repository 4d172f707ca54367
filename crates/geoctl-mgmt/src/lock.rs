//! Named advisory locks.
//!
//! A lock is held in-process (a name set shared by every guard from the same
//! registry) and, when the registry has a directory, across processes through
//! a `<name>.lock` file holding the owner's pid. The file is written under a
//! private name and hard linked into place, so a lock file is never seen
//! without its pid. Names are percent-escaped into file names. Guards release
//! both on drop.

use std::collections::HashSet;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {name} is already held by {holder}")]
    Held { name: String, holder: String },
    #[error("lock {name}: I/O error: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Default)]
pub struct LockRegistry {
    dir: Option<PathBuf>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            held: Arc::default(),
        }
    }

    /// Process-local locks only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn lock_path(&self, name: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.lock", escape(name))))
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Acquire `name` without waiting.
    pub fn try_acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if !held.insert(name.to_string()) {
                return Err(LockError::Held {
                    name: name.to_string(),
                    holder: format!("pid {}", std::process::id()),
                });
            }
        }

        let path = self.lock_path(name);
        if let Some(path) = &path {
            if let Err(e) = create_lock_file(name, path) {
                self.held
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(name);
                return Err(e);
            }
        }

        debug!(lock = %name, "lock acquired");
        Ok(LockGuard {
            name: name.to_string(),
            path,
            held: Arc::clone(&self.held),
        })
    }
}

#[derive(Debug)]
pub struct LockGuard {
    name: String,
    path: Option<PathBuf>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(lock = %self.name, path = %path.display(), error = %e, "failed to remove lock file");
            }
        }
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
        debug!(lock = %self.name, "lock released");
    }
}

fn create_lock_file(name: &str, path: &Path) -> Result<(), LockError> {
    let io_err = |source| LockError::Io {
        name: name.to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let staged = path.with_extension(format!("lock.{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&staged, format!("{}\n", std::process::id())).map_err(io_err)?;
    let linked = link_lock_file(name, &staged, path);
    if let Err(e) = std::fs::remove_file(&staged) {
        warn!(lock = %name, path = %staged.display(), error = %e, "failed to remove staged lock file");
    }
    linked
}

fn link_lock_file(name: &str, staged: &Path, path: &Path) -> Result<(), LockError> {
    let io_err = |source| LockError::Io {
        name: name.to_string(),
        source,
    };
    for attempt in 0..2 {
        match std::fs::hard_link(staged, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let contents = std::fs::read_to_string(path).ok();
                let holder = contents
                    .as_deref()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                // an empty file predates pid staging and has no owner to wait for
                let stale = match holder {
                    Some(pid) => !process_alive(pid),
                    None => contents.map_or(true, |c| c.trim().is_empty()),
                };
                if attempt == 0 && stale {
                    warn!(lock = %name, path = %path.display(), "removing stale lock file");
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                    continue;
                }
                return Err(LockError::Held {
                    name: name.to_string(),
                    holder: holder
                        .map(|pid| format!("pid {}", pid))
                        .unwrap_or_else(|| "an unknown process".to_string()),
                });
            }
            Err(e) => return Err(io_err(e)),
        }
    }
    Err(LockError::Held {
        name: name.to_string(),
        holder: "an unknown process".to_string(),
    })
}

/// Without procfs liveness is unknown; assume alive.
fn process_alive(pid: u32) -> bool {
    if !Path::new("/proc/self").exists() {
        return true;
    }
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Percent-escape every byte outside `[A-Za-z0-9._-]`, `%` included.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    out
}

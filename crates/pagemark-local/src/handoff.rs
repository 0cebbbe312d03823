//! Navigation hand-off stores: one pending record, consumed once.

use pagemark_core::{now_epoch_ms, same_page, Error, HandoffStorage, PendingHandoff, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const HANDOFF_FILE: &str = "pending-handoff.json";

/// Shared consume rule: the record is already removed; decide whether it applies.
fn accept(record: PendingHandoff, current_url: &str, max_age: Duration) -> Option<PendingHandoff> {
    if record.age(now_epoch_ms()) > max_age {
        tracing::debug!(url = record.url.as_str(), "discarding expired hand-off");
        return None;
    }
    if !same_page(&record.url, current_url) {
        tracing::debug!(
            stored = record.url.as_str(),
            current = current_url,
            "discarding hand-off for another page"
        );
        return None;
    }
    Some(record)
}

/// Process-wide slot.
#[derive(Debug)]
pub struct MemoryHandoffStore {
    slot: Mutex<Option<PendingHandoff>>,
    max_age: Duration,
}

impl MemoryHandoffStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            max_age,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingHandoff>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_empty(&self) -> bool {
        self.slot().is_none()
    }
}

impl HandoffStorage for MemoryHandoffStore {
    fn put(&self, handoff: PendingHandoff) -> Result<()> {
        let mut slot = self.slot();
        if slot.is_some() {
            tracing::debug!("overwriting unconsumed hand-off");
        }
        *slot = Some(handoff);
        Ok(())
    }

    fn take_if_matching(&self, current_url: &str) -> Result<Option<PendingHandoff>> {
        let taken = self.slot().take();
        Ok(taken.and_then(|r| accept(r, current_url, self.max_age)))
    }
}

/// Single JSON file in a directory; survives process restarts within a session.
#[derive(Debug)]
pub struct FsHandoffStore {
    path: PathBuf,
    max_age: Duration,
    lock: Mutex<()>,
}

impl FsHandoffStore {
    pub fn new(dir: impl AsRef<Path>, max_age: Duration) -> Self {
        Self {
            path: dir.as_ref().join(HANDOFF_FILE),
            max_age,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HandoffStorage for FsHandoffStore {
    fn put(&self, handoff: PendingHandoff) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }
        let bytes = serde_json::to_vec(&handoff).map_err(|e| Error::Storage(e.to_string()))?;
        // Readers never observe a partially written record.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| Error::Storage(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn take_if_matching(&self, current_url: &str) -> Result<Option<PendingHandoff>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(e.to_string())),
        };
        std::fs::remove_file(&self.path).map_err(|e| Error::Storage(e.to_string()))?;
        match serde_json::from_slice::<PendingHandoff>(&bytes) {
            Ok(record) => Ok(accept(record, current_url, self.max_age)),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable hand-off record");
                Ok(None)
            }
        }
    }
}

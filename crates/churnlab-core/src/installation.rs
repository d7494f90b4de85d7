//! Installation state control.
//!
//! A messaging installation is derived from persisted local key state.
//! Deleting that state and reactivating the same identity forces the client
//! to mint a new installation while the address stays the same, which is the
//! churn this harness manufactures.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};
use crate::identity::Address;

/// Companion suffixes written next to the primary database file.
pub const COMPANION_SUFFIXES: [&str; 3] = ["", "-shm", "-wal"];

/// Every on-disk path belonging to the installation stored at `storage_path`.
pub fn installation_files(storage_path: &Path) -> Vec<PathBuf> {
    COMPANION_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut raw = storage_path.as_os_str().to_owned();
            raw.push(suffix);
            PathBuf::from(raw)
        })
        .collect()
}

/// Remove the primary file and all companions for `storage_path`.
///
/// Missing files are skipped. Returns the paths that were actually removed.
pub fn clear_installation(storage_path: &Path) -> HarnessResult<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for path in installation_files(storage_path) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "installation file deleted");
                removed.push(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(HarnessError::Storage(e)),
        }
    }
    Ok(removed)
}

/// Lifecycle of an installation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// No agent has used this slot yet.
    Fresh,
    /// An agent instance holds the slot open.
    Active,
    /// The bound agent stopped and its persisted state was deleted.
    Stale,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Active => write!(f, "active"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// A storage path bound to one identity.
#[derive(Debug, Clone)]
pub struct InstallationSlot {
    storage_path: PathBuf,
    owner: Address,
    state: SlotState,
    retired: u32,
}

impl InstallationSlot {
    pub fn new(storage_path: impl Into<PathBuf>, owner: Address) -> Self {
        Self {
            storage_path: storage_path.into(),
            owner,
            state: SlotState::Fresh,
            retired: 0,
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn owner(&self) -> &Address {
        &self.owner
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// How many times this slot has been retired to `Stale`.
    pub fn retired_count(&self) -> u32 {
        self.retired
    }

    /// Remove leftovers from a previous run without changing the slot state.
    pub fn reset_storage(&self) -> HarnessResult<Vec<PathBuf>> {
        let removed = clear_installation(&self.storage_path)?;
        if !removed.is_empty() {
            info!(
                path = %self.storage_path.display(),
                files = removed.len(),
                "cleared leftover installation state"
            );
        }
        Ok(removed)
    }

    /// Fresh/Stale -> Active. A second concurrent holder is rejected.
    pub fn activate(&mut self) -> HarnessResult<()> {
        if self.state == SlotState::Active {
            return Err(HarnessError::SlotInUse {
                path: self.storage_path.clone(),
            });
        }
        self.state = SlotState::Active;
        Ok(())
    }

    /// Active -> Fresh/Stale without clearing state (the agent never came up).
    pub fn release(&mut self) {
        if self.state == SlotState::Active {
            self.state = if self.retired == 0 {
                SlotState::Fresh
            } else {
                SlotState::Stale
            };
        }
    }

    /// Active -> Stale: delete every persisted file so the next activation
    /// mints a new installation.
    ///
    /// The caller must have stopped the agent holding the slot.
    pub fn retire(&mut self) -> HarnessResult<Vec<PathBuf>> {
        let removed = clear_installation(&self.storage_path)?;
        self.state = SlotState::Stale;
        self.retired += 1;
        Ok(removed)
    }
}

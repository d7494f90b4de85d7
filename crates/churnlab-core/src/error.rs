//! Harness-level error taxonomy.
//!
//! Phase-fatal variants (`Initialization`, `Conversation`, `Fatal`,
//! `RunDeadlineExceeded`) abort the remaining phases. `Send`, `AsyncClient`,
//! `DeliveryTimeout` and `Shutdown` are accumulated in the run report
//! instead. A stale installation that fails to stop during churn is
//! escalated to `Fatal` by the orchestrator, since its slot cannot be
//! retired.

use std::path::PathBuf;

use crate::client::ClientError;

/// Errors produced by the reproduction harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("agent '{label}' failed to initialise: {reason}")]
    Initialization { label: String, reason: String },

    #[error("cannot open conversation with {peer}: {reason}")]
    Conversation { peer: String, reason: String },

    #[error("send #{index} failed: {reason}")]
    Send { index: usize, reason: String },

    #[error("no matching message within {timeout_ms}ms")]
    DeliveryTimeout { timeout_ms: u64 },

    #[error("asynchronous client error in '{label}': {reason}")]
    AsyncClient { label: String, reason: String },

    #[error("agent '{label}' failed to stop: {reason}")]
    Shutdown { label: String, reason: String },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("installation slot {path:?} is already held by an active agent")]
    SlotInUse { path: PathBuf },

    #[error("delivery attempt already settled as {outcome}")]
    AttemptAlreadySettled { outcome: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("run exceeded its deadline of {deadline_ms}ms")]
    RunDeadlineExceeded { deadline_ms: u64 },
}

impl HarnessError {
    /// Wrap a client rejection raised while bringing up the agent `label`.
    pub fn initialization(label: &str, err: &ClientError) -> Self {
        HarnessError::Initialization {
            label: label.to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether this error aborts the remaining phases of a run.
    pub fn is_phase_fatal(&self) -> bool {
        !matches!(
            self,
            HarnessError::Send { .. }
                | HarnessError::DeliveryTimeout { .. }
                | HarnessError::AsyncClient { .. }
                | HarnessError::Shutdown { .. }
        )
    }
}

/// Result type for harness operations.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

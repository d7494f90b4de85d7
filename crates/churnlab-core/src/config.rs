//! Run configuration.
//!
//! Defaults reproduce the reference reproduction timings: 3 stale installations,
//! 3 s registration grace, 8 messages at 1 s spacing, a 10 s observation
//! window and a 30 s delivery timeout for the single-message exchange.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::NetworkEnv;
use crate::error::{HarnessError, HarnessResult};
use crate::identity::Address;

/// Which exchange the run performs after bring-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Single "poke" with a matched delivery wait.
    #[default]
    Poke,
    /// N unconfirmed messages plus a passive observation window.
    Stress,
    /// Receive-only: bring up the receiver and log until shut down.
    Listen,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poke => write!(f, "poke"),
            Self::Stress => write!(f, "stress"),
            Self::Listen => write!(f, "listen"),
        }
    }
}

impl FromStr for Variant {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poke" | "simple" => Ok(Self::Poke),
            "stress" | "batch" => Ok(Self::Stress),
            "listen" | "recv-only" => Ok(Self::Listen),
            other => Err(HarnessError::InvalidConfig(format!("unknown variant: {other}"))),
        }
    }
}

/// Every knob of a reproduction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub variant: Variant,
    pub network: NetworkEnv,
    pub debug: bool,
    /// Directory holding `receiver.db3` and `sender.db3`.
    pub work_dir: PathBuf,
    pub stale_installations: u32,
    pub message_count: u32,
    pub message_interval_ms: u64,
    pub delivery_timeout_ms: u64,
    pub observation_window_ms: u64,
    /// Hold time after each churned agent comes online.
    pub registration_grace_ms: u64,
    /// Pause after clearing a churned installation.
    pub churn_pause_ms: u64,
    /// Pause between sender bring-up and the exchange.
    pub sync_pause_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Send to this address instead of bringing up a local receiver.
    pub receiver_address: Option<Address>,
    /// Overall deadline for everything before cleanup.
    pub run_deadline_ms: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Poke,
            network: NetworkEnv::Local,
            debug: false,
            work_dir: PathBuf::from("."),
            stale_installations: 3,
            message_count: 8,
            message_interval_ms: 1_000,
            delivery_timeout_ms: 30_000,
            observation_window_ms: 10_000,
            registration_grace_ms: 3_000,
            churn_pause_ms: 1_000,
            sync_pause_ms: 3_000,
            heartbeat_interval_ms: 5_000,
            receiver_address: None,
            run_deadline_ms: None,
        }
    }
}

impl HarnessConfig {
    /// Zero every fixed pause (grace, churn, sync). Timeouts are kept.
    pub fn without_pauses(mut self) -> Self {
        self.registration_grace_ms = 0;
        self.churn_pause_ms = 0;
        self.sync_pause_ms = 0;
        self
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.variant == Variant::Stress && self.message_count == 0 {
            return Err(HarnessError::InvalidConfig(
                "stress variant needs at least one message".into(),
            ));
        }
        if self.variant == Variant::Poke && self.delivery_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "delivery timeout must be greater than zero".into(),
            ));
        }
        if self.variant == Variant::Listen && self.receiver_address.is_some() {
            return Err(HarnessError::InvalidConfig(
                "listen mode needs a local receiver; drop the receiver address".into(),
            ));
        }
        if self.variant == Variant::Listen && self.heartbeat_interval_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "heartbeat interval must be greater than zero".into(),
            ));
        }
        if self.run_deadline_ms == Some(0) {
            return Err(HarnessError::InvalidConfig(
                "run deadline must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn receiver_db_path(&self) -> PathBuf {
        self.work_dir.join("receiver.db3")
    }

    pub fn sender_db_path(&self) -> PathBuf {
        self.work_dir.join("sender.db3")
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_millis(self.message_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_millis(self.observation_window_ms)
    }

    pub fn registration_grace(&self) -> Duration {
        Duration::from_millis(self.registration_grace_ms)
    }

    pub fn churn_pause(&self) -> Duration {
        Duration::from_millis(self.churn_pause_ms)
    }

    pub fn sync_pause(&self) -> Duration {
        Duration::from_millis(self.sync_pause_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_ms.map(Duration::from_millis)
    }
}

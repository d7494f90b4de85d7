//! Terminal run report.
//!
//! A delivery timeout is reported as an observation, not collapsed into a
//! pass/fail verdict: whether it confirms the reproduced defect depends on
//! the defect report being chased.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentFault;
use crate::client::{InstallationId, NetworkEnv};
use crate::config::Variant;
use crate::orchestrator::Phase;

pub const REPORT_SCHEMA_VERSION: &str = "churnlab.run.v1";

/// Observed result of the message exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    /// The run never reached the exchange.
    #[default]
    NotAttempted,
    Delivered,
    TimedOut,
    SendFailed,
    /// Sent to an external receiver; delivery cannot be observed.
    NotObserved,
}

impl std::fmt::Display for ExchangeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotAttempted => "not_attempted",
            Self::Delivered => "delivered",
            Self::TimedOut => "timed_out",
            Self::SendFailed => "send_failed",
            Self::NotObserved => "not_observed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub variant: Variant,
    pub network: NetworkEnv,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Furthest phase entered before cleanup.
    pub phase_reached: Phase,
    pub completed: bool,
    pub sender_address: Option<String>,
    pub receiver_address: Option<String>,
    pub stale_installations_created: u32,
    pub stale_installation_ids: Vec<InstallationId>,
    pub final_installation_id: Option<InstallationId>,
    pub sender_installation_id: Option<InstallationId>,
    pub messages_attempted: u32,
    pub messages_sent: u32,
    pub messages_failed: u32,
    pub messages_delivered: u32,
    pub messages_timed_out: u32,
    pub messages_observed: u32,
    pub batch_duration_ms: Option<u64>,
    pub outcome: ExchangeOutcome,
    pub send_errors: Vec<String>,
    pub agent_errors: Vec<AgentFault>,
    pub cleanup_errors: Vec<String>,
    pub fatal_error: Option<String>,
}

impl RunReport {
    pub fn new(variant: Variant, network: NetworkEnv) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            variant,
            network,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            phase_reached: Phase::Init,
            completed: false,
            sender_address: None,
            receiver_address: None,
            stale_installations_created: 0,
            stale_installation_ids: Vec::new(),
            final_installation_id: None,
            sender_installation_id: None,
            messages_attempted: 0,
            messages_sent: 0,
            messages_failed: 0,
            messages_delivered: 0,
            messages_timed_out: 0,
            messages_observed: 0,
            batch_duration_ms: None,
            outcome: ExchangeOutcome::NotAttempted,
            send_errors: Vec::new(),
            agent_errors: Vec::new(),
            cleanup_errors: Vec::new(),
            fatal_error: None,
        }
    }

    /// No fatal error escaped the phases.
    pub fn is_success(&self) -> bool {
        self.fatal_error.is_none()
    }

    /// Agent errors carrying `code`, e.g. decryption failures.
    pub fn errors_with_code(&self, code: &str) -> usize {
        self.agent_errors
            .iter()
            .filter(|e| e.fault.code.as_deref() == Some(code))
            .count()
    }

    pub fn finish(&mut self, duration_ms: u64) {
        self.finished_at = Some(Utc::now());
        self.duration_ms = duration_ms;
    }
}

fn opt<T: std::fmt::Display>(value: Option<&T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Render the plain-text summary printed at the end of a run.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "run {} ({} on {})\n",
        report.run_id, report.variant, report.network
    ));
    out.push_str(&format!(
        "  phase reached:               {:?}{}\n",
        report.phase_reached,
        if report.completed { " (completed)" } else { "" }
    ));
    out.push_str(&format!(
        "  receiver:                    {}\n",
        opt(report.receiver_address.as_ref())
    ));
    out.push_str(&format!(
        "  sender:                      {}\n",
        opt(report.sender_address.as_ref())
    ));
    out.push_str(&format!(
        "  stale_installations_created={}\n",
        report.stale_installations_created
    ));
    for id in &report.stale_installation_ids {
        out.push_str(&format!("    - {id}\n"));
    }
    out.push_str(&format!(
        "  final installation:          {}\n",
        opt(report.final_installation_id.as_ref())
    ));
    out.push_str(&format!(
        "  messages_attempted={} messages_sent={} messages_failed={} messages_delivered={} messages_timed_out={}\n",
        report.messages_attempted,
        report.messages_sent,
        report.messages_failed,
        report.messages_delivered,
        report.messages_timed_out
    ));
    if let Some(ms) = report.batch_duration_ms {
        out.push_str(&format!("  batch duration:              {ms}ms\n"));
    }
    out.push_str(&format!("  outcome={}\n", report.outcome));

    if !report.agent_errors.is_empty() {
        out.push_str(&format!("  agent errors ({}):\n", report.agent_errors.len()));
        for err in &report.agent_errors {
            out.push_str(&format!("    [{}] {}\n", err.agent, err.fault));
        }
    }
    for err in &report.send_errors {
        out.push_str(&format!("  send error: {err}\n"));
    }
    for err in &report.cleanup_errors {
        out.push_str(&format!("  cleanup error: {err}\n"));
    }
    if let Some(fatal) = &report.fatal_error {
        out.push_str(&format!("  FATAL: {fatal}\n"));
    }
    out.push_str(&format!("  duration: {}ms\n", report.duration_ms));
    out
}

/// Write the report as pretty JSON.
pub fn write_report_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientFault;

    fn sample() -> RunReport {
        let mut report = RunReport::new(Variant::Stress, NetworkEnv::Local);
        report.stale_installations_created = 2;
        report.stale_installation_ids = vec![InstallationId("aaa".into()), InstallationId("bbb".into())];
        report.messages_attempted = 8;
        report.messages_sent = 7;
        report.messages_failed = 1;
        report.outcome = ExchangeOutcome::TimedOut;
        report.agent_errors.push(AgentFault {
            agent: "receiver (final)".into(),
            fault: ClientFault::new("HpkeDecryptError", "stale").with_code("1002"),
            observed_at: Utc::now(),
        });
        report
    }

    #[test]
    fn test_new_report_is_not_attempted() {
        let report = RunReport::new(Variant::Poke, NetworkEnv::Local);
        assert_eq!(report.outcome, ExchangeOutcome::NotAttempted);
        assert_eq!(report.phase_reached, Phase::Init);
        assert!(report.is_success());
        assert_eq!(report.schema_version, REPORT_SCHEMA_VERSION);
    }

    #[test]
    fn test_summary_contains_counts_and_errors() {
        let text = render_summary(&sample());
        assert!(text.contains("stale_installations_created=2"));
        assert!(text.contains("messages_sent=7"));
        assert!(text.contains("messages_failed=1"));
        assert!(text.contains("outcome=timed_out"));
        assert!(text.contains("[receiver (final)] HpkeDecryptError [1002]: stale"));
        assert!(!text.contains("FATAL"));
    }

    #[test]
    fn test_errors_with_code() {
        let report = sample();
        assert_eq!(report.errors_with_code("1002"), 1);
        assert_eq!(report.errors_with_code("9999"), 0);
    }

    #[test]
    fn test_write_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report_json(&path, &sample()).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["variant"], "stress");
        assert_eq!(value["outcome"], "timed_out");
        assert_eq!(value["stale_installation_ids"][1], "bbb");
    }
}

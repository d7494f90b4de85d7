//! Structured observability hooks for the reproduction run.
//!
//! Every phase transition and every observation that ends up in the run
//! report is also emitted here as a structured `tracing` event with an
//! `event = "..."` field. Set `RUST_LOG` to filter and pass `--json` to the
//! binary for machine-readable output.

use tracing::{debug, error, info, warn};

/// Run-scoped span. Attach it to the run future with
/// [`tracing::Instrument::instrument`] so every event carries the run id.
///
/// ```ignore
/// orchestrator.execute(&mut report).instrument(run_span("9f1c...")).await;
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("churnlab.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, variant: &str, network: &str) {
    info!(event = "run.started", run_id = %run_id, variant = %variant, network = %network);
}

pub fn emit_phase_entered(phase: &str) {
    info!(event = "phase.entered", phase = %phase);
}

/// One churn iteration finished: the installation is now stale.
pub fn emit_installation_churned(iteration: u32, total: u32, installation_id: &str) {
    info!(
        event = "installation.churned",
        iteration = iteration,
        total = total,
        installation_id = %installation_id,
    );
}

pub fn emit_agent_ready(label: &str, installation_id: &str) {
    info!(event = "agent.ready", agent = %label, installation_id = %installation_id);
}

pub fn emit_agent_stopped(label: &str) {
    debug!(event = "agent.stopped", agent = %label);
}

/// Asynchronous client error captured on an agent handle.
pub fn emit_agent_error(label: &str, code: Option<&str>, error: &dyn std::fmt::Display) {
    error!(
        event = "agent.error",
        agent = %label,
        code = code.unwrap_or("-"),
        error = %error,
    );
}

pub fn emit_message_sent(index: usize, total: usize) {
    info!(event = "message.sent", index = index, total = total);
}

pub fn emit_send_failed(index: usize, error: &dyn std::fmt::Display) {
    warn!(event = "message.send_failed", index = index, error = %error);
}

pub fn emit_message_received(label: &str, sender: &str, content: &str) {
    info!(event = "message.received", agent = %label, sender = %sender, content = %content);
}

pub fn emit_delivery_settled(outcome: &str, waited_ms: u64) {
    info!(event = "delivery.settled", outcome = %outcome, waited_ms = waited_ms);
}

/// A best-effort cleanup step failed; the remaining steps still run.
pub fn emit_cleanup_error(label: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cleanup.error", agent = %label, error = %error);
}

pub fn emit_run_fatal(phase: &str, error: &dyn std::fmt::Display) {
    error!(event = "run.fatal", phase = %phase, error = %error);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, outcome: &str, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        outcome = %outcome,
        success = success,
    );
}

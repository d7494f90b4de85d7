//! Observability tests for the reproduction run.
//!
//! These verify that the structured `event = "..."` records the run report
//! is built from are actually emitted.

use std::sync::Arc;

use churnlab_core::obs::{
    emit_agent_error, emit_cleanup_error, emit_delivery_settled, emit_installation_churned,
    emit_run_fatal, emit_run_finished, emit_run_started, run_span,
};
use churnlab_core::{HarnessConfig, LoopbackNetwork, Orchestrator};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_run_started_logs_variant_and_network() {
    emit_run_started("run-123", "poke", "local");
    assert!(logs_contain("run.started"));
    assert!(logs_contain("run-123"));
}

#[traced_test]
#[test]
fn test_emit_installation_churned_logs_iteration() {
    emit_installation_churned(2, 3, "3f9c0d");
    assert!(logs_contain("installation.churned"));
    assert!(logs_contain("3f9c0d"));
}

#[traced_test]
#[test]
fn test_emit_agent_error_logs_code() {
    emit_agent_error("receiver (final)", Some("1002"), &"HpkeDecryptError");
    assert!(logs_contain("agent.error"));
    assert!(logs_contain("1002"));
}

#[traced_test]
#[test]
fn test_emit_failure_paths() {
    emit_cleanup_error("sender", &"client already gone");
    emit_run_fatal("sender_ready", &"agent 'sender' failed to initialise");
    emit_delivery_settled("timed_out", 30_000);
    emit_run_finished("run-err", 31_000, "timed_out", false);

    assert!(logs_contain("cleanup.error"));
    assert!(logs_contain("run.fatal"));
    assert!(logs_contain("delivery.settled"));
    assert!(logs_contain("run.finished"));
}

#[traced_test]
#[test]
fn test_run_span_carries_run_id() {
    let span = run_span("span-run-7");
    let _entered = span.enter();
    tracing::info!("inside");
    assert!(logs_contain("span-run-7"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_run_emits_lifecycle_events() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HarnessConfig {
        work_dir: dir.path().to_path_buf(),
        stale_installations: 1,
        ..Default::default()
    }
    .without_pauses();

    let report = Orchestrator::new(Arc::new(LoopbackNetwork::new()), cfg)
        .unwrap()
        .run()
        .await;
    assert!(report.is_success());

    assert!(logs_contain("run.started"));
    assert!(logs_contain("phase.entered"));
    assert!(logs_contain("installation.churned"));
    assert!(logs_contain("agent.ready"));
    assert!(logs_contain("message.sent"));
    assert!(logs_contain("message.received"));
    assert!(logs_contain("delivery.settled"));
    assert!(logs_contain("run.finished"));
    assert!(logs_contain(&report.run_id));
}

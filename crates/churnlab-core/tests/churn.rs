//! Installation churn tests.
//!
//! Each churned installation must be a distinct installation of the same
//! identity, and the final receiver must come up on yet another one.

use std::collections::HashSet;
use std::sync::Arc;

use churnlab_core::{
    clear_installation, installation_files, AgentHandle, Address, HarnessConfig, HarnessError,
    Identity, InstallationSlot, LifecycleState, LoopbackNetwork, NetworkEnv, Orchestrator,
    Signer, SlotState, StartStyle,
};

fn poke_config(dir: &std::path::Path, stale: u32) -> HarnessConfig {
    HarnessConfig {
        work_dir: dir.to_path_buf(),
        stale_installations: stale,
        ..Default::default()
    }
    .without_pauses()
}

#[tokio::test(start_paused = true)]
async fn test_each_churn_mints_a_new_installation() {
    for k in 0..=3u32 {
        let dir = tempfile::tempdir().unwrap();
        let net = LoopbackNetwork::new();
        let orchestrator = Orchestrator::new(Arc::new(net.clone()), poke_config(dir.path(), k)).unwrap();

        let report = orchestrator.run().await;
        assert!(report.is_success(), "k={k}: {:?}", report.fatal_error);
        assert_eq!(report.stale_installations_created, k);
        assert_eq!(report.stale_installation_ids.len(), k as usize);

        let receiver = Address::parse(report.receiver_address.as_deref().unwrap()).unwrap();
        let registered = net.installations(&receiver);
        assert_eq!(registered.len(), k as usize + 1, "k={k}");

        let distinct: HashSet<_> = registered.iter().collect();
        assert_eq!(distinct.len(), registered.len(), "installation ids must be distinct");

        let final_id = report.final_installation_id.clone().unwrap();
        assert_eq!(registered.last(), Some(&final_id));
        assert!(!report.stale_installation_ids.contains(&final_id));
        assert_eq!(&registered[..k as usize], report.stale_installation_ids.as_slice());

        // Cleanup stopped everything.
        assert!(net.live_installations(&receiver).is_empty());
    }
}

#[test]
fn test_clear_installation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("receiver.db3");
    for path in installation_files(&db) {
        std::fs::write(&path, b"state").unwrap();
    }

    let removed = clear_installation(&db).unwrap();
    assert_eq!(removed.len(), 3);
    assert!(installation_files(&db).iter().all(|p| !p.exists()));

    assert!(clear_installation(&db).unwrap().is_empty());
}

#[test]
fn test_clear_installation_with_partial_companions() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("receiver.db3");
    std::fs::write(&db, b"state").unwrap();

    let removed = clear_installation(&db).unwrap();
    assert_eq!(removed, vec![db.clone()]);
    assert!(!db.exists());
}

#[tokio::test]
async fn test_corrupted_storage_fails_initialisation_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("receiver.db3");
    std::fs::write(&db, b"\x00\x01 not an installation").unwrap();

    let net = LoopbackNetwork::new();
    let identity = Identity::from_secret(&[4u8; 32]);
    let mut slot = InstallationSlot::new(&db, identity.address().clone());

    let err = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "receiver")
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Initialization { .. }), "{err}");
    assert!(err.is_phase_fatal());
    assert_eq!(slot.state(), SlotState::Fresh);
    assert!(net.installations(identity.address()).is_empty());
}

#[tokio::test]
async fn test_non_local_network_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let net = LoopbackNetwork::new();
    let identity = Identity::from_secret(&[5u8; 32]);
    let mut slot = InstallationSlot::new(dir.path().join("r.db3"), identity.address().clone());

    let err = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Dev, "receiver")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("loopback backend"), "{err}");
}

#[tokio::test]
async fn test_slot_holds_one_agent_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let net = LoopbackNetwork::new();
    let identity = Identity::from_secret(&[6u8; 32]);
    let mut slot = InstallationSlot::new(dir.path().join("r.db3"), identity.address().clone());

    let mut first = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "first")
        .await
        .unwrap();
    let err = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "second")
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::SlotInUse { .. }));

    first.stop().await.unwrap();
    slot.retire().unwrap();
    assert_eq!(slot.state(), SlotState::Stale);
    assert_eq!(slot.retired_count(), 1);

    let mut second = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "second")
        .await
        .unwrap();
    second.stop().await.unwrap();
}

async fn bring_up_and_stop(style: StartStyle) {
    let dir = tempfile::tempdir().unwrap();
    let net = LoopbackNetwork::new().with_start_style(style);
    let identity = Identity::from_secret(&[7u8; 32]);
    let mut slot = InstallationSlot::new(dir.path().join("r.db3"), identity.address().clone());

    let mut agent = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "receiver")
        .await
        .unwrap();
    assert_eq!(agent.lifecycle(), LifecycleState::Created);
    assert!(agent.wait_until_ready().await.is_err(), "never started");

    agent.start().await.unwrap();
    agent.wait_until_ready().await.unwrap();
    assert_eq!(agent.lifecycle(), LifecycleState::Ready);

    let id = agent.installation_id().unwrap();
    assert_eq!(net.live_installations(identity.address()), vec![id]);

    agent.stop().await.unwrap();
    agent.stop().await.unwrap();
    assert_eq!(agent.lifecycle(), LifecycleState::Stopped);
    assert!(net.live_installations(identity.address()).is_empty());
    assert!(agent.errors().is_empty());
}

#[tokio::test]
async fn test_await_ready_start_style() {
    bring_up_and_stop(StartStyle::AwaitReady).await;
}

#[tokio::test]
async fn test_fire_and_event_start_style() {
    bring_up_and_stop(StartStyle::FireAndEvent).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_ready_fails_the_wait() {
    let dir = tempfile::tempdir().unwrap();
    let net = LoopbackNetwork::new()
        .with_start_style(StartStyle::FireAndEvent)
        .with_startup_latency(std::time::Duration::from_secs(5));
    let identity = Identity::from_secret(&[8u8; 32]);
    let mut slot = InstallationSlot::new(dir.path().join("r.db3"), identity.address().clone());

    let mut agent = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "slow")
        .await
        .unwrap();
    agent.start().await.unwrap();
    agent.stop().await.unwrap();

    let err = agent.wait_until_ready().await.unwrap_err();
    assert!(matches!(err, HarnessError::Initialization { .. }));
    assert!(net.live_installations(identity.address()).is_empty());
}

#[tokio::test]
async fn test_background_start_failure_reaches_the_error_slot() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("receiver.db3");
    let net = LoopbackNetwork::new().with_start_style(StartStyle::FireAndEvent);
    let identity = Identity::from_secret(&[9u8; 32]);
    let mut slot = InstallationSlot::new(&db, identity.address().clone());

    let mut agent = AgentHandle::create(&net, &identity, &mut slot, NetworkEnv::Local, "receiver")
        .await
        .unwrap();
    clear_installation(&db).unwrap();

    // start() only spawns; the failure surfaces through the handle.
    agent.start().await.unwrap();
    let err = agent.wait_until_ready().await.unwrap_err();
    assert!(matches!(err, HarnessError::Initialization { .. }), "{err}");
    assert_eq!(agent.lifecycle(), LifecycleState::Errored);

    let errors = agent.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].agent, "receiver");
    assert!(errors[0].fault.message.contains("disappeared before start"), "{:?}", errors[0]);
    assert!(net.live_installations(identity.address()).is_empty());

    agent.stop().await.unwrap();
}

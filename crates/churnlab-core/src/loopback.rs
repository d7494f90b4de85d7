//! In-process loopback network.
//!
//! Implements [`ClientFactory`] without any external service so the full
//! churn -> exchange state machine can run locally and in tests.
//!
//! Model:
//! - The persisted installation state is a small file at the storage path
//!   (plus a `-wal` companion). An existing file resumes its installation;
//!   a missing file mints a new one.
//! - The network keeps every installation ever registered for an address.
//!   Stopping a client only detaches it, so once its local state is deleted
//!   the record is stale from everyone else's point of view.
//! - [`FaultModel::DecryptFailure`] makes live recipients emit a decryption
//!   error instead of the message once enough detached installations pile up
//!   for their identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::client::{
    ClientError, ClientEvent, ClientFactory, ClientFault, ClientOptions, Conversation,
    InboundMessage, InstallationId, MessagingClient, NetworkEnv, StartStyle,
};
use crate::identity::{Address, Signer};
use crate::installation::installation_files;

const RECORD_PREFIX: &str = "installation:";
const EVENT_CAPACITY: usize = 256;

/// Error code surfaced by [`FaultModel::DecryptFailure`].
pub const DECRYPT_FAILURE_CODE: &str = "1002";

/// Optional misbehaviour injected into message delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultModel {
    #[default]
    None,
    /// Live recipients fail to decrypt once their identity has at least
    /// `stale_threshold` detached installations.
    DecryptFailure { stale_threshold: usize },
}

#[derive(Debug)]
struct InstallationRecord {
    id: InstallationId,
    live: Option<broadcast::Sender<ClientEvent>>,
}

#[derive(Debug, Default)]
struct Registry {
    installations: Mutex<HashMap<Address, Vec<InstallationRecord>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Address, Vec<InstallationRecord>>> {
        self.installations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, address: &Address, id: &InstallationId, tx: broadcast::Sender<ClientEvent>) {
        let mut map = self.lock();
        let records = map.entry(address.clone()).or_default();
        match records.iter_mut().find(|r| &r.id == id) {
            Some(record) => record.live = Some(tx),
            None => records.push(InstallationRecord {
                id: id.clone(),
                live: Some(tx),
            }),
        }
    }

    fn detach(&self, address: &Address, id: &InstallationId) {
        if let Some(records) = self.lock().get_mut(address) {
            if let Some(record) = records.iter_mut().find(|r| &r.id == id) {
                record.live = None;
            }
        }
    }
}

/// In-process [`ClientFactory`] backed by a shared installation registry.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    registry: Arc<Registry>,
    start_style: StartStyle,
    fault: FaultModel,
    startup_latency: Duration,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            start_style: StartStyle::FireAndEvent,
            fault: FaultModel::None,
            startup_latency: Duration::ZERO,
        }
    }

    pub fn with_start_style(mut self, style: StartStyle) -> Self {
        self.start_style = style;
        self
    }

    pub fn with_fault(mut self, fault: FaultModel) -> Self {
        self.fault = fault;
        self
    }

    /// Simulated delay between `start()` and readiness.
    pub fn with_startup_latency(mut self, latency: Duration) -> Self {
        self.startup_latency = latency;
        self
    }

    /// Every installation ever registered for `address`, oldest first.
    pub fn installations(&self, address: &Address) -> Vec<InstallationId> {
        self.registry
            .lock()
            .get(address)
            .map(|records| records.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Installations of `address` with a running client.
    pub fn live_installations(&self, address: &Address) -> Vec<InstallationId> {
        self.registry
            .lock()
            .get(address)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.live.is_some())
                    .map(|r| r.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

async fn load_or_mint(storage_path: &Path) -> Result<InstallationId, ClientError> {
    match tokio::fs::read_to_string(storage_path).await {
        Ok(raw) => {
            let id = raw
                .trim()
                .strip_prefix(RECORD_PREFIX)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    ClientError::CorruptedStorage(format!(
                        "{} is not an installation record",
                        storage_path.display()
                    ))
                })?;
            Ok(InstallationId(id.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = InstallationId(uuid::Uuid::new_v4().simple().to_string());
            tokio::fs::write(storage_path, format!("{RECORD_PREFIX}{id}\n")).await?;
            // Companion write-ahead file, removed together with the primary.
            if let Some(wal) = installation_files(storage_path).last() {
                tokio::fs::write(wal, b"").await?;
            }
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClientFactory for LoopbackNetwork {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        options: ClientOptions,
    ) -> Result<Arc<dyn MessagingClient>, ClientError> {
        if options.network != NetworkEnv::Local {
            return Err(ClientError::UnsupportedNetwork(format!(
                "loopback backend only serves '{}', got '{}'",
                NetworkEnv::Local,
                options.network
            )));
        }

        let installation_id = load_or_mint(&options.storage_path).await?;
        let registration = signer.sign(installation_id.0.as_bytes());
        if registration.is_empty() {
            return Err(ClientError::Transport("unsigned installation registration".into()));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        debug!(
            address = %signer.address().short(),
            installation_id = %installation_id.short(),
            "loopback client created"
        );

        Ok(Arc::new(LoopbackClient {
            registry: Arc::clone(&self.registry),
            style: self.start_style,
            fault: self.fault,
            latency: self.startup_latency,
            address: signer.address().clone(),
            storage_path: options.storage_path,
            installation_id,
            events,
            shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct LoopbackClient {
    registry: Arc<Registry>,
    style: StartStyle,
    fault: FaultModel,
    latency: Duration,
    address: Address,
    storage_path: PathBuf,
    installation_id: InstallationId,
    events: broadcast::Sender<ClientEvent>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

#[async_trait]
impl MessagingClient for LoopbackClient {
    fn start_style(&self) -> StartStyle {
        self.style
    }

    async fn start(&self) -> Result<(), ClientError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        // Persisted state vanished underneath a starting client.
        if !tokio::fs::try_exists(&self.storage_path).await? {
            return Err(ClientError::CorruptedStorage(format!(
                "{} disappeared before start",
                self.storage_path.display()
            )));
        }

        self.registry
            .attach(&self.address, &self.installation_id, self.events.clone());
        self.started.store(true, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::Ready {
            installation_id: self.installation_id.clone(),
        });
        info!(
            address = %self.address.short(),
            installation_id = %self.installation_id.short(),
            "loopback installation online"
        );

        if self.style == StartStyle::FireAndEvent {
            // Run the "event loop" until stop() is called.
            let mut shutdown = self.shutdown.subscribe();
            let _ = shutdown.wait_for(|stop| *stop).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        self.registry.detach(&self.address, &self.installation_id);
        Ok(())
    }

    fn installation_id(&self) -> Option<InstallationId> {
        self.started
            .load(Ordering::SeqCst)
            .then(|| self.installation_id.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn new_conversation(
        &self,
        peer: &Address,
    ) -> Result<Box<dyn Conversation>, ClientError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(ClientError::NotStarted);
        }
        let known = self
            .registry
            .lock()
            .get(peer)
            .is_some_and(|records| !records.is_empty());
        if !known {
            return Err(ClientError::PeerUnreachable(format!(
                "{peer} has no registered installations"
            )));
        }

        Ok(Box::new(LoopbackConversation {
            id: dm_id(&self.address, peer),
            registry: Arc::clone(&self.registry),
            fault: self.fault,
            sender: self.address.clone(),
            peer: peer.clone(),
        }))
    }
}

/// Stable direct-message id for an unordered pair of addresses.
fn dm_id(a: &Address, b: &Address) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let digest = Sha256::digest(format!("{lo}:{hi}").as_bytes());
    hex::encode(&digest[..8])
}

struct LoopbackConversation {
    id: String,
    registry: Arc<Registry>,
    fault: FaultModel,
    sender: Address,
    peer: Address,
}

#[async_trait]
impl Conversation for LoopbackConversation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &str) -> Result<(), ClientError> {
        let (live, detached) = {
            let map = self.registry.lock();
            let records = map.get(&self.peer).ok_or_else(|| {
                ClientError::PeerUnreachable(format!("{} vanished", self.peer))
            })?;
            let live: Vec<_> = records.iter().filter_map(|r| r.live.clone()).collect();
            let detached = records.len() - live.len();
            (live, detached)
        };

        let event = match self.fault {
            FaultModel::DecryptFailure { stale_threshold } if detached >= stale_threshold => {
                ClientEvent::Error(
                    ClientFault::new(
                        "HpkeDecryptError",
                        format!(
                            "failed to decrypt message from {}: {detached} stale installation(s) on recipient identity",
                            self.sender.short()
                        ),
                    )
                    .with_code(DECRYPT_FAILURE_CODE),
                )
            }
            _ => ClientEvent::Message(InboundMessage {
                content: payload.to_string(),
                sender: self.sender.clone(),
                conversation_id: self.id.clone(),
            }),
        };

        // Offline recipients simply never see it.
        for tx in live {
            let _ = tx.send(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn options(path: &Path) -> ClientOptions {
        ClientOptions {
            network: NetworkEnv::Local,
            storage_path: path.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_existing_state_resumes_installation() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("r.db3");
        let net = LoopbackNetwork::new().with_start_style(StartStyle::AwaitReady);
        let signer: Arc<dyn Signer> = Arc::new(Identity::from_secret(&[9u8; 32]));

        let first = net.create(Arc::clone(&signer), options(&db)).await.unwrap();
        first.start().await.unwrap();
        let id = first.installation_id().unwrap();
        first.stop().await.unwrap();

        let second = net.create(signer, options(&db)).await.unwrap();
        second.start().await.unwrap();
        assert_eq!(second.installation_id().unwrap(), id);
    }

    #[tokio::test]
    async fn test_deleted_state_mints_new_installation() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("r.db3");
        let net = LoopbackNetwork::new().with_start_style(StartStyle::AwaitReady);
        let identity = Identity::from_secret(&[4u8; 32]);
        let signer: Arc<dyn Signer> = Arc::new(identity.clone());

        let first = net.create(Arc::clone(&signer), options(&db)).await.unwrap();
        first.start().await.unwrap();
        first.stop().await.unwrap();
        crate::installation::clear_installation(&db).unwrap();

        let second = net.create(signer, options(&db)).await.unwrap();
        second.start().await.unwrap();

        let all = net.installations(identity.address());
        assert_eq!(all.len(), 2);
        assert_ne!(all[0], all[1]);
        assert_eq!(net.live_installations(identity.address()), vec![all[1].clone()]);
    }

    #[tokio::test]
    async fn test_corrupted_storage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("r.db3");
        std::fs::write(&db, "garbage").unwrap();
        let net = LoopbackNetwork::new();
        let signer: Arc<dyn Signer> = Arc::new(Identity::from_secret(&[5u8; 32]));

        let err = net.create(signer, options(&db)).await.err().unwrap();
        assert!(matches!(err, ClientError::CorruptedStorage(_)));
    }

    #[tokio::test]
    async fn test_non_local_network_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let net = LoopbackNetwork::new();
        let signer: Arc<dyn Signer> = Arc::new(Identity::from_secret(&[6u8; 32]));
        let opts = ClientOptions {
            network: NetworkEnv::Dev,
            storage_path: dir.path().join("s.db3"),
        };
        let err = net.create(signer, opts).await.err().unwrap();
        assert!(matches!(err, ClientError::UnsupportedNetwork(_)));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let net = LoopbackNetwork::new().with_start_style(StartStyle::AwaitReady);
        let signer: Arc<dyn Signer> = Arc::new(Identity::from_secret(&[7u8; 32]));
        let client = net.create(signer, options(&dir.path().join("s.db3"))).await.unwrap();
        client.start().await.unwrap();

        let stranger = Identity::from_secret(&[8u8; 32]);
        let err = client.new_conversation(stranger.address()).await.err().unwrap();
        assert!(matches!(err, ClientError::PeerUnreachable(_)));
    }

    #[test]
    fn test_dm_id_is_symmetric() {
        let a = Identity::from_secret(&[1u8; 32]);
        let b = Identity::from_secret(&[2u8; 32]);
        assert_eq!(dm_id(a.address(), b.address()), dm_id(b.address(), a.address()));
        assert_eq!(dm_id(a.address(), b.address()).len(), 16);
    }
}

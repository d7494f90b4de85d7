//! Agent lifecycle adapter.
//!
//! Wraps a [`MessagingClient`] into an [`AgentHandle`] with:
//! - a uniform [`AgentHandle::wait_until_ready`] regardless of whether the
//!   client's `start()` awaits readiness or runs as a background event loop;
//! - an [`ErrorSlot`] that captures every asynchronously emitted client error,
//!   attributed to the agent that produced it, instead of letting it escape.
//!
//! A background event pump is spawned at creation time, before `start`, so
//! no readiness or error event can be missed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{
    ClientEvent, ClientFactory, ClientFault, ClientOptions, InstallationId, MessagingClient,
    NetworkEnv, StartStyle,
};
use crate::delivery::MessageListener;
use crate::error::{HarnessError, HarnessResult};
use crate::identity::{Address, Identity, Signer};
use crate::installation::InstallationSlot;
use crate::metrics::METRICS;
use crate::obs;

/// Lifecycle of an agent handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Starting,
    Ready,
    Stopped,
    Errored,
}

impl LifecycleState {
    fn is_settled(self) -> bool {
        !matches!(self, Self::Created | Self::Starting)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

/// A client error captured on an agent handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFault {
    pub agent: String,
    pub fault: ClientFault,
    pub observed_at: DateTime<Utc>,
}

impl From<&AgentFault> for HarnessError {
    fn from(fault: &AgentFault) -> Self {
        HarnessError::AsyncClient {
            label: fault.agent.clone(),
            reason: fault.fault.to_string(),
        }
    }
}

/// Append-only error slot shared between a handle and its background tasks.
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot {
    faults: Arc<Mutex<Vec<AgentFault>>>,
}

impl ErrorSlot {
    pub fn record(&self, agent: &str, fault: ClientFault) {
        let fault = AgentFault {
            agent: agent.to_string(),
            fault,
            observed_at: Utc::now(),
        };
        obs::emit_agent_error(agent, fault.fault.code.as_deref(), &HarnessError::from(&fault));
        METRICS.inc_client_errors();
        self.lock().push(fault);
    }

    pub fn snapshot(&self) -> Vec<AgentFault> {
        self.lock().clone()
    }

    /// Take every fault recorded so far, leaving the slot empty.
    pub fn drain(&self) -> Vec<AgentFault> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn last_message(&self) -> Option<String> {
        self.lock().last().map(|f| f.fault.to_string())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AgentFault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply a lifecycle transition if it is legal. Returns whether it happened.
fn transition(state: &watch::Sender<LifecycleState>, to: LifecycleState) -> bool {
    use LifecycleState::*;
    state.send_if_modified(|current| {
        let allowed = match (*current, to) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Created, Starting) => true,
            (Created | Starting, Ready | Errored) => true,
            _ => false,
        };
        if allowed {
            *current = to;
        }
        allowed
    })
}

type InstallationCell = Arc<Mutex<Option<InstallationId>>>;

fn set_installation(cell: &InstallationCell, id: InstallationId) {
    *cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
}

/// Handle to one running (or stopped) agent bound to an installation slot.
pub struct AgentHandle {
    label: String,
    address: Address,
    storage_path: PathBuf,
    client: Arc<dyn MessagingClient>,
    state: Arc<watch::Sender<LifecycleState>>,
    installation: InstallationCell,
    errors: ErrorSlot,
    pump: Option<JoinHandle<()>>,
    start_task: Option<JoinHandle<()>>,
}

impl AgentHandle {
    /// Create a client for `identity` on `slot`, activating the slot.
    ///
    /// A client rejection (e.g. corrupted storage) releases the slot and is
    /// returned as [`HarnessError::Initialization`]; it is never retried.
    pub async fn create(
        factory: &dyn ClientFactory,
        identity: &Identity,
        slot: &mut InstallationSlot,
        network: NetworkEnv,
        label: impl Into<String>,
    ) -> HarnessResult<Self> {
        let label = label.into();
        if slot.owner() != identity.address() {
            return Err(HarnessError::InvalidConfig(format!(
                "slot {} belongs to {}, not {}",
                slot.storage_path().display(),
                slot.owner(),
                identity.address()
            )));
        }
        slot.activate()?;

        let options = ClientOptions {
            network,
            storage_path: slot.storage_path().to_path_buf(),
        };
        let signer: Arc<dyn Signer> = Arc::new(identity.clone());
        let client = match factory.create(signer, options).await {
            Ok(client) => client,
            Err(e) => {
                slot.release();
                return Err(HarnessError::initialization(&label, &e));
            }
        };

        let (state, _) = watch::channel(LifecycleState::Created);
        let state = Arc::new(state);
        let errors = ErrorSlot::default();
        let installation: InstallationCell = Arc::new(Mutex::new(None));

        let pump = tokio::spawn(pump_events(
            label.clone(),
            client.subscribe(),
            state.subscribe(),
            Arc::clone(&state),
            errors.clone(),
            Arc::clone(&installation),
        ));

        debug!(
            agent = %label,
            address = %identity.address().short(),
            path = %slot.storage_path().display(),
            "agent created"
        );

        Ok(Self {
            label,
            address: identity.address().clone(),
            storage_path: slot.storage_path().to_path_buf(),
            client,
            state,
            installation,
            errors,
            pump: Some(pump),
            start_task: None,
        })
    }

    /// Trigger the client's bring-up.
    ///
    /// For [`StartStyle::AwaitReady`] clients this returns once the client
    /// is online. For [`StartStyle::FireAndEvent`] clients the call is
    /// spawned and this returns immediately; its eventual error lands in the
    /// error slot. Either way, follow with [`Self::wait_until_ready`].
    pub async fn start(&mut self) -> HarnessResult<()> {
        if !transition(&self.state, LifecycleState::Starting) {
            return Err(HarnessError::Initialization {
                label: self.label.clone(),
                reason: format!("cannot start from {} state", self.lifecycle()),
            });
        }

        match self.client.start_style() {
            StartStyle::AwaitReady => {
                if let Err(e) = self.client.start().await {
                    transition(&self.state, LifecycleState::Errored);
                    return Err(HarnessError::initialization(&self.label, &e));
                }
                if let Some(id) = self.client.installation_id() {
                    set_installation(&self.installation, id);
                }
                transition(&self.state, LifecycleState::Ready);
            }
            StartStyle::FireAndEvent => {
                let client = Arc::clone(&self.client);
                let state = Arc::clone(&self.state);
                let errors = self.errors.clone();
                let label = self.label.clone();
                self.start_task = Some(tokio::spawn(async move {
                    if let Err(e) = client.start().await {
                        errors.record(&label, ClientFault::from(&e));
                        transition(&state, LifecycleState::Errored);
                    }
                }));
            }
        }
        Ok(())
    }

    /// Resolve once the agent is network-ready.
    ///
    /// Fails with [`HarnessError::Initialization`] when the agent errors or
    /// is stopped before becoming ready, or was never started.
    pub async fn wait_until_ready(&self) -> HarnessResult<()> {
        if self.lifecycle() == LifecycleState::Created {
            return Err(HarnessError::Initialization {
                label: self.label.clone(),
                reason: "start() was never called".into(),
            });
        }

        let mut rx = self.state.subscribe();
        let settled = *rx
            .wait_for(|s| s.is_settled())
            .await
            .map_err(|_| HarnessError::Fatal(format!("lifecycle of '{}' dropped", self.label)))?;

        match settled {
            LifecycleState::Ready => {
                let id = self
                    .installation_id()
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                obs::emit_agent_ready(&self.label, &id);
                Ok(())
            }
            LifecycleState::Errored => Err(HarnessError::Initialization {
                label: self.label.clone(),
                reason: self
                    .errors
                    .last_message()
                    .unwrap_or_else(|| "start failed".into()),
            }),
            other => Err(HarnessError::Initialization {
                label: self.label.clone(),
                reason: format!("agent {other} before becoming ready"),
            }),
        }
    }

    /// Release the client's resources. Idempotent; safe before `start`
    /// completed. Events already emitted are drained into the error slot.
    pub async fn stop(&mut self) -> HarnessResult<()> {
        if self.lifecycle() == LifecycleState::Stopped {
            return Ok(());
        }

        let result = self.client.stop().await;
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
        transition(&self.state, LifecycleState::Stopped);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        obs::emit_agent_stopped(&self.label);

        result.map_err(|e| HarnessError::Shutdown {
            label: self.label.clone(),
            reason: e.to_string(),
        })
    }

    /// Attach a message listener. Only messages emitted after this call are
    /// observable through it.
    pub fn message_listener(&self) -> MessageListener {
        MessageListener::new(self.label.clone(), self.client.subscribe())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn installation_id(&self) -> Option<InstallationId> {
        self.installation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .or_else(|| self.client.installation_id())
    }

    pub fn errors(&self) -> Vec<AgentFault> {
        self.errors.snapshot()
    }

    pub fn take_errors(&self) -> Vec<AgentFault> {
        self.errors.drain()
    }

    pub(crate) fn client(&self) -> &Arc<dyn MessagingClient> {
        &self.client
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("label", &self.label)
            .field("address", &self.address)
            .field("lifecycle", &self.lifecycle())
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

fn handle_event(
    label: &str,
    event: ClientEvent,
    state: &watch::Sender<LifecycleState>,
    errors: &ErrorSlot,
    installation: &InstallationCell,
) {
    match event {
        ClientEvent::Ready { installation_id } => {
            debug!(agent = %label, installation_id = %installation_id, "ready event");
            set_installation(installation, installation_id);
            transition(state, LifecycleState::Ready);
        }
        ClientEvent::Error(fault) => errors.record(label, fault),
        // Messages are observed through dedicated listeners.
        ClientEvent::Message(_) => {}
    }
}

/// Forward client events into the handle until the agent stops, then drain
/// whatever is still buffered.
async fn pump_events(
    label: String,
    mut events: broadcast::Receiver<ClientEvent>,
    mut lifecycle: watch::Receiver<LifecycleState>,
    state: Arc<watch::Sender<LifecycleState>>,
    errors: ErrorSlot,
    installation: InstallationCell,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => handle_event(&label, event, &state, &errors, &installation),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(agent = %label, skipped = skipped, "event pump lagged");
                }
                Err(RecvError::Closed) => return,
            },
            _ = lifecycle.wait_for(|s| *s == LifecycleState::Stopped) => {
                loop {
                    match events.try_recv() {
                        Ok(event) => handle_event(&label, event, &state, &errors, &installation),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_follow_lifecycle() {
        let (state, _rx) = watch::channel(LifecycleState::Created);
        assert!(!transition(&state, LifecycleState::Created));
        assert!(transition(&state, LifecycleState::Starting));
        assert!(transition(&state, LifecycleState::Ready));
        // Post-start errors do not un-ready an agent.
        assert!(!transition(&state, LifecycleState::Errored));
        assert!(transition(&state, LifecycleState::Stopped));
        assert!(!transition(&state, LifecycleState::Ready));
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }

    #[test]
    fn test_errored_only_moves_to_stopped() {
        let (state, _rx) = watch::channel(LifecycleState::Starting);
        assert!(transition(&state, LifecycleState::Errored));
        assert!(!transition(&state, LifecycleState::Ready));
        assert!(transition(&state, LifecycleState::Stopped));
    }

    #[test]
    fn test_error_slot_drain_empties() {
        let slot = ErrorSlot::default();
        slot.record("receiver", ClientFault::new("E", "first"));
        slot.record("receiver", ClientFault::new("E", "second"));
        assert_eq!(slot.len(), 2);
        assert_eq!(slot.last_message().unwrap(), "E: second");

        let drained = slot.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].agent, "receiver");
        assert!(slot.is_empty());
    }
}

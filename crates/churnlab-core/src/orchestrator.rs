//! Reproduction orchestrator.
//!
//! Linear phase machine with no back-edges:
//!
//! ```text
//! Init -> ChurnInstallations(xK) -> FinalReceiverReady -> SenderReady
//!      -> ExchangeMessages -> ObservationWindow -> Cleanup -> Done
//! ```
//!
//! Every step is awaited in order; at most one installation of the receiver
//! identity is active at any time. A phase-fatal error skips the remaining
//! phases, but cleanup always runs and stops every agent still alive.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::agent::AgentHandle;
use crate::client::ClientFactory;
use crate::config::{HarnessConfig, Variant};
use crate::delivery::{
    await_delivery, batch_payload, observe, open_conversation, send, send_batch,
    ConversationHandle, DeliveryAttempt, DeliveryOutcome, MessageListener,
};
use crate::error::{HarnessError, HarnessResult};
use crate::identity::{create_identity, Identity, Signer};
use crate::installation::InstallationSlot;
use crate::metrics::METRICS;
use crate::obs;
use crate::report::{ExchangeOutcome, RunReport};

/// Payload of the single-message exchange.
pub const POKE: &str = "poke";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    ChurnInstallations,
    FinalReceiverReady,
    Listening,
    SenderReady,
    ExchangeMessages,
    ObservationWindow,
    Cleanup,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ChurnInstallations => "churn_installations",
            Self::FinalReceiverReady => "final_receiver_ready",
            Self::Listening => "listening",
            Self::SenderReady => "sender_ready",
            Self::ExchangeMessages => "exchange_messages",
            Self::ObservationWindow => "observation_window",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        }
    }
}

/// Agents that may still need stopping during cleanup.
#[derive(Default)]
struct LiveAgents {
    churn: Option<AgentHandle>,
    receiver: Option<AgentHandle>,
    sender: Option<AgentHandle>,
}

impl LiveAgents {
    fn drain_errors(&self, report: &mut RunReport) {
        for handle in [&self.churn, &self.receiver, &self.sender].into_iter().flatten() {
            report.agent_errors.extend(handle.take_errors());
        }
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// Drives one reproduction run end to end.
pub struct Orchestrator {
    factory: Arc<dyn ClientFactory>,
    config: HarnessConfig,
}

impl Orchestrator {
    pub fn new(factory: Arc<dyn ClientFactory>, config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self { factory, config })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run every phase and return the terminal report.
    ///
    /// Never fails: phase-fatal errors are recorded in
    /// [`RunReport::fatal_error`] after cleanup has run.
    pub async fn run(&self) -> RunReport {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Self::run`]; in listen mode `shutdown` ends the listening phase.
    pub async fn run_until<S>(&self, shutdown: S) -> RunReport
    where
        S: Future<Output = ()>,
    {
        let mut report = RunReport::new(self.config.variant, self.config.network);
        let span = obs::run_span(&report.run_id);
        self.execute(&mut report, shutdown).instrument(span).await;
        report
    }

    async fn execute<S>(&self, report: &mut RunReport, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let started = Instant::now();
        obs::emit_run_started(
            &report.run_id,
            &self.config.variant.to_string(),
            &self.config.network.to_string(),
        );
        let mut agents = LiveAgents::default();

        let phases = self.run_phases(report, &mut agents, shutdown);
        let result = match self.config.run_deadline() {
            Some(deadline) => match tokio::time::timeout(deadline, phases).await {
                Ok(result) => result,
                Err(_) => Err(HarnessError::RunDeadlineExceeded {
                    deadline_ms: deadline.as_millis() as u64,
                }),
            },
            None => phases.await,
        };

        match result {
            Ok(()) => report.completed = true,
            Err(e) => {
                obs::emit_run_fatal(report.phase_reached.as_str(), &e);
                report.fatal_error = Some(e.to_string());
            }
        }

        self.cleanup(report, &mut agents).await;

        report.finish(started.elapsed().as_millis() as u64);
        METRICS.flush();
        obs::emit_run_finished(
            &report.run_id,
            report.duration_ms,
            &report.outcome.to_string(),
            report.is_success(),
        );
    }

    fn enter(&self, report: &mut RunReport, phase: Phase) {
        obs::emit_phase_entered(phase.as_str());
        if phase < Phase::Cleanup {
            report.phase_reached = phase;
        }
    }

    async fn run_phases<S>(
        &self,
        report: &mut RunReport,
        agents: &mut LiveAgents,
        shutdown: S,
    ) -> HarnessResult<()>
    where
        S: Future<Output = ()>,
    {
        let cfg = &self.config;
        self.enter(report, Phase::Init);

        let receiver_identity = match cfg.receiver_address {
            Some(_) => None,
            None => Some(create_identity("receiver")?),
        };
        let receiver_address = cfg
            .receiver_address
            .clone()
            .or_else(|| receiver_identity.as_ref().map(|i| i.address().clone()))
            .ok_or_else(|| HarnessError::Fatal("no receiver address".into()))?;
        report.receiver_address = Some(receiver_address.to_string());
        info!(receiver = %receiver_address, "receiver identity");

        let mut listener = None;
        if let Some(identity) = &receiver_identity {
            let mut slot = InstallationSlot::new(cfg.receiver_db_path(), identity.address().clone());
            slot.reset_storage()?;

            self.enter(report, Phase::ChurnInstallations);
            self.churn(identity, &mut slot, report, agents).await?;

            self.enter(report, Phase::FinalReceiverReady);
            let receiver = agents.receiver.insert(
                AgentHandle::create(
                    self.factory.as_ref(),
                    identity,
                    &mut slot,
                    cfg.network,
                    "receiver (final)",
                )
                .await?,
            );
            // Attach before any activity so nothing sent to the receiver is missed.
            listener = Some(receiver.message_listener());
            receiver.start().await?;
            receiver.wait_until_ready().await?;
            report.final_installation_id = receiver.installation_id();
            agents.drain_errors(report);
        } else {
            info!("external receiver: skipping churn and local receiver bring-up");
        }

        if cfg.variant == Variant::Listen {
            let listener = listener
                .as_mut()
                .ok_or_else(|| HarnessError::Fatal("listen mode without a local receiver".into()))?;
            self.enter(report, Phase::Listening);
            return self.listen(listener, report, agents, shutdown).await;
        }

        self.enter(report, Phase::SenderReady);
        let sender_identity = create_identity("sender")?;
        report.sender_address = Some(sender_identity.address().to_string());
        let mut sender_slot =
            InstallationSlot::new(cfg.sender_db_path(), sender_identity.address().clone());
        sender_slot.reset_storage()?;
        {
            let sender = agents.sender.insert(
                AgentHandle::create(
                    self.factory.as_ref(),
                    &sender_identity,
                    &mut sender_slot,
                    cfg.network,
                    "sender",
                )
                .await?,
            );
            sender.start().await?;
            sender.wait_until_ready().await?;
            report.sender_installation_id = sender.installation_id();
        }
        agents.drain_errors(report);
        pause(cfg.sync_pause()).await;

        self.enter(report, Phase::ExchangeMessages);
        let sender = agents
            .sender
            .as_ref()
            .ok_or_else(|| HarnessError::Fatal("sender vanished before exchange".into()))?;
        let conversation = open_conversation(sender, &receiver_address).await?;

        match cfg.variant {
            Variant::Poke => {
                self.exchange_poke(&conversation, listener.as_mut(), report)
                    .await?
            }
            Variant::Stress => {
                self.exchange_batch(&conversation, listener.as_mut(), report)
                    .await?
            }
            Variant::Listen => {}
        }
        agents.drain_errors(report);
        Ok(())
    }

    /// Create, bring up, hold, stop and clear `stale_installations` receiver
    /// installations, strictly one after another.
    async fn churn(
        &self,
        identity: &Identity,
        slot: &mut InstallationSlot,
        report: &mut RunReport,
        agents: &mut LiveAgents,
    ) -> HarnessResult<()> {
        let total = self.config.stale_installations;
        for i in 1..=total {
            info!(iteration = i, total = total, "creating stale installation");
            let installation_id = {
                let handle = agents.churn.insert(
                    AgentHandle::create(
                        self.factory.as_ref(),
                        identity,
                        slot,
                        self.config.network,
                        format!("receiver (stale #{i})"),
                    )
                    .await?,
                );
                handle.start().await?;
                handle.wait_until_ready().await?;
                let id = handle.installation_id();
                // Network-registration grace period.
                pause(self.config.registration_grace()).await;
                // The slot cannot be retired while the client may still hold it.
                handle.stop().await.map_err(|e| {
                    HarnessError::Fatal(format!("stale installation #{i} could not be stopped: {e}"))
                })?;
                id
            };
            if let Some(handle) = agents.churn.take() {
                report.agent_errors.extend(handle.take_errors());
            }

            let removed = slot.retire()?;
            let id = installation_id.ok_or_else(|| {
                HarnessError::Fatal(format!("stale installation #{i} reported no installation id"))
            })?;
            info!(
                iteration = i,
                installation_id = %id.short(),
                files_removed = removed.len(),
                "installation state deleted"
            );
            obs::emit_installation_churned(i, total, &id.to_string());
            METRICS.inc_installations_churned();
            report.stale_installations_created += 1;
            report.stale_installation_ids.push(id);

            pause(self.config.churn_pause()).await;
        }
        Ok(())
    }

    async fn exchange_poke(
        &self,
        conversation: &ConversationHandle,
        listener: Option<&mut MessageListener>,
        report: &mut RunReport,
    ) -> HarnessResult<()> {
        let mut attempt = DeliveryAttempt::new(1, POKE);
        report.messages_attempted = 1;

        if let Err(e) = send(conversation, &mut attempt).await {
            if e.is_phase_fatal() {
                return Err(e);
            }
            obs::emit_send_failed(1, &e);
            report.messages_failed = 1;
            report.send_errors.push(e.to_string());
            report.outcome = ExchangeOutcome::SendFailed;
            return Ok(());
        }
        report.messages_sent = 1;
        obs::emit_message_sent(1, 1);

        let Some(listener) = listener else {
            info!("message sent to external receiver; delivery is not observable");
            report.outcome = ExchangeOutcome::NotObserved;
            return Ok(());
        };

        let outcome = await_delivery(
            listener,
            |msg| msg.content == POKE,
            self.config.delivery_timeout(),
        )
        .await;
        attempt.settle(outcome)?;

        if outcome == DeliveryOutcome::Delivered {
            report.messages_delivered = 1;
            report.outcome = ExchangeOutcome::Delivered;
        } else {
            let err = HarnessError::DeliveryTimeout {
                timeout_ms: self.config.delivery_timeout_ms,
            };
            warn!(error = %err, "poke not observed on the receiver");
            report.messages_timed_out = 1;
            report.outcome = ExchangeOutcome::TimedOut;
        }
        Ok(())
    }

    async fn exchange_batch(
        &self,
        conversation: &ConversationHandle,
        listener: Option<&mut MessageListener>,
        report: &mut RunReport,
    ) -> HarnessResult<()> {
        let total = self.config.message_count as usize;
        let payloads: Vec<String> = (1..=total).map(|i| batch_payload(i, total)).collect();
        report.messages_attempted = self.config.message_count;

        let mut batch = send_batch(conversation, &payloads, self.config.message_interval()).await;
        report.messages_sent = batch.sent;
        report.messages_failed = batch.failed;
        report.batch_duration_ms = Some(batch.elapsed.as_millis() as u64);
        report.send_errors.extend(batch.attempts.iter().filter_map(|a| {
            a.error
                .as_ref()
                .map(|err| format!("message {}: {err}", a.index))
        }));

        self.enter(report, Phase::ObservationWindow);
        let Some(listener) = listener else {
            pause(self.config.observation_window()).await;
            report.outcome = if batch.sent == 0 {
                ExchangeOutcome::SendFailed
            } else {
                ExchangeOutcome::NotObserved
            };
            return Ok(());
        };

        let seen = observe(listener, self.config.observation_window()).await;
        report.messages_observed = seen.len() as u32;
        let seen: HashSet<&str> = seen.iter().map(|m| m.content.as_str()).collect();

        let mut delivered = 0;
        for attempt in batch
            .attempts
            .iter_mut()
            .filter(|a| a.outcome() == DeliveryOutcome::Pending)
        {
            let outcome = if seen.contains(attempt.payload.as_str()) {
                delivered += 1;
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::TimedOut
            };
            attempt.settle(outcome)?;
        }

        report.messages_delivered = delivered;
        report.messages_timed_out = batch.sent - delivered;
        report.outcome = if batch.sent == 0 {
            ExchangeOutcome::SendFailed
        } else if delivered == batch.sent {
            ExchangeOutcome::Delivered
        } else {
            ExchangeOutcome::TimedOut
        };
        Ok(())
    }

    async fn listen<S>(
        &self,
        listener: &mut MessageListener,
        report: &mut RunReport,
        agents: &LiveAgents,
        shutdown: S,
    ) -> HarnessResult<()>
    where
        S: Future<Output = ()>,
    {
        info!(
            receiver = report.receiver_address.as_deref().unwrap_or("-"),
            "listening for messages until shutdown"
        );
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let started = Instant::now();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                msg = listener.next_message() => match msg {
                    Some(_) => report.messages_observed += 1,
                    None => {
                        warn!("receiver event stream closed");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    info!(
                        event = "listen.heartbeat",
                        uptime_s = started.elapsed().as_secs(),
                        messages = report.messages_observed,
                        "waiting for messages"
                    );
                    agents.drain_errors(report);
                }
            }
        }
        agents.drain_errors(report);
        Ok(())
    }

    /// Stop every agent still alive. Each stop is independent: one failure
    /// is recorded and the others still run.
    async fn cleanup(&self, report: &mut RunReport, agents: &mut LiveAgents) {
        self.enter(report, Phase::Cleanup);
        for handle in [
            agents.sender.as_mut(),
            agents.receiver.as_mut(),
            agents.churn.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = handle.stop().await {
                obs::emit_cleanup_error(handle.label(), &e);
                report.cleanup_errors.push(e.to_string());
            }
        }
        agents.drain_errors(report);
        self.enter(report, Phase::Done);
    }
}

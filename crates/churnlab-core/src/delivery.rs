//! Delivery verification.
//!
//! The harness has no backchannel telling it a message was lost; silence is
//! the only signal. [`await_delivery`] therefore races the receiver's event
//! stream against a timer, and [`send_batch`] + [`observe`] assess a batch
//! by passively watching the receiver for a trailing window.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::agent::AgentHandle;
use crate::client::{ClientEvent, Conversation, InboundMessage};
use crate::error::{HarnessError, HarnessResult};
use crate::identity::Address;
use crate::metrics::METRICS;
use crate::obs;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Pending,
    Delivered,
    TimedOut,
    SendFailed,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::TimedOut => "timed_out",
            Self::SendFailed => "send_failed",
        };
        write!(f, "{s}")
    }
}

/// One payload sent to the receiver. The outcome leaves `Pending` exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub index: usize,
    pub payload: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    outcome: DeliveryOutcome,
}

impl DeliveryAttempt {
    pub fn new(index: usize, payload: impl Into<String>) -> Self {
        Self {
            index,
            payload: payload.into(),
            sent_at: None,
            error: None,
            outcome: DeliveryOutcome::Pending,
        }
    }

    pub fn outcome(&self) -> DeliveryOutcome {
        self.outcome
    }

    /// Move from `Pending` to a terminal outcome.
    pub fn settle(&mut self, outcome: DeliveryOutcome) -> HarnessResult<()> {
        if self.outcome != DeliveryOutcome::Pending || outcome == DeliveryOutcome::Pending {
            return Err(HarnessError::AttemptAlreadySettled {
                outcome: self.outcome.to_string(),
            });
        }
        self.outcome = outcome;
        Ok(())
    }
}

/// A conversation opened by a sender agent towards one peer.
pub struct ConversationHandle {
    sender: Address,
    peer: Address,
    inner: Box<dyn Conversation>,
}

impl ConversationHandle {
    pub fn new(sender: Address, peer: Address, inner: Box<dyn Conversation>) -> Self {
        Self { sender, peer, inner }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn participants(&self) -> (&Address, &Address) {
        (&self.sender, &self.peer)
    }
}

impl fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("id", &self.id())
            .field("sender", &self.sender)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Receiver-side view of incoming messages, subscribed at creation time.
pub struct MessageListener {
    label: String,
    events: broadcast::Receiver<ClientEvent>,
}

impl MessageListener {
    pub fn new(label: impl Into<String>, events: broadcast::Receiver<ClientEvent>) -> Self {
        Self {
            label: label.into(),
            events,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next inbound message, or `None` once the client's event channel closes.
    pub async fn next_message(&mut self) -> Option<InboundMessage> {
        loop {
            match self.events.recv().await {
                Ok(ClientEvent::Message(msg)) => {
                    obs::emit_message_received(&self.label, msg.sender.as_str(), &msg.content);
                    return Some(msg);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(agent = %self.label, skipped = skipped, "message listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Open a conversation from `sender` to `peer`.
pub async fn open_conversation(
    sender: &AgentHandle,
    peer: &Address,
) -> HarnessResult<ConversationHandle> {
    let inner = sender
        .client()
        .new_conversation(peer)
        .await
        .map_err(|e| HarnessError::Conversation {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;
    debug!(conversation = %inner.id(), peer = %peer.short(), "conversation opened");
    Ok(ConversationHandle::new(sender.address().clone(), peer.clone(), inner))
}

/// Send one attempt's payload. A failure settles the attempt as `SendFailed`.
pub async fn send(
    conversation: &ConversationHandle,
    attempt: &mut DeliveryAttempt,
) -> HarnessResult<()> {
    attempt.sent_at = Some(Utc::now());
    match conversation.inner.send(&attempt.payload).await {
        Ok(()) => {
            METRICS.inc_messages_sent();
            Ok(())
        }
        Err(e) => {
            METRICS.inc_send_failures();
            attempt.error = Some(e.to_string());
            attempt.settle(DeliveryOutcome::SendFailed)?;
            Err(HarnessError::Send {
                index: attempt.index,
                reason: e.to_string(),
            })
        }
    }
}

/// Race the first message matching `matches` against `timeout`.
///
/// Resolves `Delivered` only if the match arrives strictly before the
/// deadline. The losing branch is dropped without further action.
pub async fn await_delivery<P>(
    listener: &mut MessageListener,
    matches: P,
    timeout: Duration,
) -> DeliveryOutcome
where
    P: Fn(&InboundMessage) -> bool,
{
    let started = Instant::now();
    let matched = async {
        while let Some(msg) = listener.next_message().await {
            if matches(&msg) {
                return Some(msg);
            }
        }
        None
    };

    let outcome = tokio::select! {
        biased;
        _ = tokio::time::sleep(timeout) => DeliveryOutcome::TimedOut,
        Some(_) = matched => DeliveryOutcome::Delivered,
    };

    match outcome {
        DeliveryOutcome::Delivered => METRICS.inc_deliveries(),
        _ => METRICS.inc_delivery_timeouts(),
    }
    obs::emit_delivery_settled(&outcome.to_string(), started.elapsed().as_millis() as u64);
    outcome
}

/// Result of an unconfirmed batch send.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub attempts: Vec<DeliveryAttempt>,
    pub sent: u32,
    pub failed: u32,
    pub elapsed: Duration,
}

/// Send every payload in order, pausing `interval` between sends.
///
/// Individual failures are recorded and the batch continues; nothing waits
/// for per-message confirmation.
pub async fn send_batch(
    conversation: &ConversationHandle,
    payloads: &[String],
    interval: Duration,
) -> BatchReport {
    let started = Instant::now();
    let total = payloads.len();
    let mut attempts = Vec::with_capacity(total);
    let mut sent = 0;
    let mut failed = 0;

    for (i, payload) in payloads.iter().enumerate() {
        let index = i + 1;
        let mut attempt = DeliveryAttempt::new(index, payload.clone());
        match send(conversation, &mut attempt).await {
            Ok(()) => {
                sent += 1;
                obs::emit_message_sent(index, total);
            }
            Err(e) => {
                failed += 1;
                obs::emit_send_failed(index, &e);
            }
        }
        attempts.push(attempt);

        if index < total && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    BatchReport {
        attempts,
        sent,
        failed,
        elapsed: started.elapsed(),
    }
}

/// Passively collect messages for the whole `window`.
pub async fn observe(listener: &mut MessageListener, window: Duration) -> Vec<InboundMessage> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, listener.next_message()).await {
            Ok(Some(msg)) => seen.push(msg),
            Ok(None) => {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            Err(_) => break,
        }
    }
    seen
}

/// Payload for message `index` of `total` in the batch variant.
pub fn batch_payload(index: usize, total: usize) -> String {
    format!("Test message {index}/{total} - Testing HPKE decryption with stale installations")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_settles_exactly_once() {
        let mut attempt = DeliveryAttempt::new(1, "poke");
        assert_eq!(attempt.outcome(), DeliveryOutcome::Pending);
        attempt.settle(DeliveryOutcome::Delivered).unwrap();
        assert_eq!(attempt.outcome(), DeliveryOutcome::Delivered);

        let err = attempt.settle(DeliveryOutcome::TimedOut).unwrap_err();
        assert!(matches!(err, HarnessError::AttemptAlreadySettled { .. }));
        assert_eq!(attempt.outcome(), DeliveryOutcome::Delivered);
    }

    #[test]
    fn test_attempt_cannot_settle_to_pending() {
        let mut attempt = DeliveryAttempt::new(1, "poke");
        assert!(attempt.settle(DeliveryOutcome::Pending).is_err());
        assert_eq!(attempt.outcome(), DeliveryOutcome::Pending);
    }

    #[test]
    fn test_batch_payload_format() {
        assert_eq!(
            batch_payload(3, 8),
            "Test message 3/8 - Testing HPKE decryption with stale installations"
        );
    }
}

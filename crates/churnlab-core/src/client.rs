//! Messaging-client seams.
//!
//! The harness never talks to a transport directly. It drives a
//! [`MessagingClient`] obtained from a [`ClientFactory`] and reacts to the
//! [`ClientEvent`]s it broadcasts. [`crate::loopback`] provides an in-process
//! implementation; a real network backend plugs in behind the same traits.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::HarnessError;
use crate::identity::{Address, Signer};

/// Installation identifier assigned by the client once it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallationId(pub String);

impl InstallationId {
    /// Short form (first 12 chars) for log lines.
    pub fn short(&self) -> &str {
        self.0
            .char_indices()
            .nth(12)
            .map_or(&self.0[..], |(i, _)| &self.0[..i])
    }
}

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network environment selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEnv {
    /// In-process loopback network.
    #[default]
    Local,
    Dev,
    Production,
}

impl fmt::Display for NetworkEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Dev => write!(f, "dev"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for NetworkEnv {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" => Ok(Self::Dev),
            "production" | "prod" => Ok(Self::Production),
            other => Err(HarnessError::InvalidConfig(format!(
                "unknown network environment: {other}"
            ))),
        }
    }
}

/// Options handed to [`ClientFactory::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub network: NetworkEnv,
    pub storage_path: PathBuf,
}

/// How a client signals that `start` has brought it online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStyle {
    /// `start()` completes only once the client is network-ready.
    AwaitReady,
    /// `start()` runs the client's event loop; readiness arrives as
    /// [`ClientEvent::Ready`].
    FireAndEvent,
}

/// Error payload emitted asynchronously by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFault {
    pub code: Option<String>,
    pub name: String,
    pub message: String,
}

impl ClientFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ClientFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

impl From<&ClientError> for ClientFault {
    fn from(err: &ClientError) -> Self {
        ClientFault::new("ClientError", err.to_string())
    }
}

/// A message delivered to a live installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub content: String,
    pub sender: Address,
    pub conversation_id: String,
}

/// Events broadcast by a client over its lifetime.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Ready { installation_id: InstallationId },
    Message(InboundMessage),
    Error(ClientFault),
}

/// Errors returned synchronously by client calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("corrupted storage: {0}")]
    CorruptedStorage(String),

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("client has not been started")]
    NotStarted,

    #[error("client has been stopped")]
    Stopped,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

/// A logical channel to one peer.
#[async_trait]
pub trait Conversation: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, payload: &str) -> Result<(), ClientError>;
}

/// Lifecycle, event and conversation surface of a messaging client.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    fn start_style(&self) -> StartStyle;

    async fn start(&self) -> Result<(), ClientError>;

    /// Release resources. Safe to call when `start` never completed.
    async fn stop(&self) -> Result<(), ClientError>;

    /// Available once the client has come online.
    fn installation_id(&self) -> Option<InstallationId>;

    /// Subscribe to events emitted from now on. Earlier events are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;

    async fn new_conversation(&self, peer: &Address)
        -> Result<Box<dyn Conversation>, ClientError>;
}

/// Builds clients bound to an identity and a storage path.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        options: ClientOptions,
    ) -> Result<Arc<dyn MessagingClient>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_env_parse() {
        assert_eq!("dev".parse::<NetworkEnv>().unwrap(), NetworkEnv::Dev);
        assert_eq!(" Production ".parse::<NetworkEnv>().unwrap(), NetworkEnv::Production);
        assert_eq!("local".parse::<NetworkEnv>().unwrap(), NetworkEnv::Local);
        assert!("staging".parse::<NetworkEnv>().is_err());
    }

    #[test]
    fn test_client_fault_display_includes_code() {
        let fault = ClientFault::new("HpkeDecryptError", "cannot open welcome").with_code("1002");
        assert_eq!(fault.to_string(), "HpkeDecryptError [1002]: cannot open welcome");
        let plain = ClientFault::new("Oops", "no code");
        assert_eq!(plain.to_string(), "Oops: no code");
    }

    #[test]
    fn test_installation_id_short() {
        let id = InstallationId("0123456789abcdef".into());
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(InstallationId("abc".into()).short(), "abc");
    }

    #[test]
    fn test_installation_id_short_counts_chars() {
        let id = InstallationId("aéééééééééééééé".into());
        assert_eq!(id.short(), "aééééééééééé");
        assert_eq!(id.short().chars().count(), 12);
        assert_eq!(InstallationId("né".into()).short(), "né");
    }
}

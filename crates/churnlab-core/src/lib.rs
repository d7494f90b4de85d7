//! churnlab core library
//!
//! Reproduction harness for installation churn: drives a messaging identity
//! through repeated create/discard cycles of its local installation state,
//! then verifies whether a message sent to the identity's final installation
//! is actually delivered.

pub mod agent;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod installation;
pub mod loopback;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod report;
pub mod telemetry;

pub use agent::{AgentFault, AgentHandle, ErrorSlot, LifecycleState};
pub use client::{
    ClientError, ClientEvent, ClientFactory, ClientFault, ClientOptions, Conversation,
    InboundMessage, InstallationId, MessagingClient, NetworkEnv, StartStyle,
};
pub use config::{HarnessConfig, Variant};
pub use delivery::{
    await_delivery, batch_payload, observe, open_conversation, send, send_batch, BatchReport,
    ConversationHandle, DeliveryAttempt, DeliveryOutcome, MessageListener,
};
pub use error::{HarnessError, HarnessResult};
pub use identity::{create_identity, Address, Identity, Signer};
pub use installation::{clear_installation, installation_files, InstallationSlot, SlotState};
pub use loopback::{FaultModel, LoopbackNetwork, DECRYPT_FAILURE_CODE};
pub use orchestrator::{Orchestrator, Phase, POKE};
pub use report::{render_summary, write_report_json, ExchangeOutcome, RunReport};
pub use telemetry::{default_directives, init_tracing};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

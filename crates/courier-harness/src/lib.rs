//! Deterministic simulation harness for Courier session testing.
//!
//! Seeded implementations of the Environment and Transport traits for
//! reproducible tests of reconnects, flushes and reconciliation.
//!
//! # Simulated server
//!
//! [`SimServer`] is an in-process stand-in for the message server. Its
//! [`SimTransport`] plugs into [`SyncHandle`](courier_client::SyncHandle) so
//! whole sessions run end to end under tokio's paused clock.
//!
//! # Invariant Testing
//!
//! The `invariants` module provides behavioral testing through invariant
//! checks. Invariants verify WHAT must be true across all execution paths, not
//! specific scenarios. Use [`InvariantRegistry::standard()`] for the session
//! invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod invariants;
pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;

pub use invariants::{
    ActiveConversationRead, ConversationSnapshot, Invariant, InvariantRegistry, InvariantResult,
    NoDuplicateServerIds, OneMessagePerSend, PendingRecordsBacked, SessionSnapshot,
    SystemSnapshot, UnreadTotalMatches, Violation,
};
pub use sim_env::SimEnv;
pub use sim_server::{ConnectOutcome, EchoMode, SimServer};
pub use sim_transport::SimTransport;

/// Let every spawned task run until idle.
///
/// Requires a paused tokio clock: time only advances once nothing else can
/// make progress, so this returns after in-flight work settles and before any
/// timer longer than a millisecond fires.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

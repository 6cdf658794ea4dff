//! Courier core
//!
//! Sans-IO state machines for real-time message sync: reconciling optimistic
//! sends with their server confirmations, tracking unread counts and deciding
//! when to reconnect.
//!
//! # Architecture
//!
//! Every component receives inputs (transport events, timer expiries, user
//! commands) and returns actions for the caller to execute. Nothing here
//! touches a socket or a clock directly; time and randomness come from an
//! [`Environment`], so the same code runs under tokio and under deterministic
//! simulation.
//!
//! # Components
//!
//! - [`ReconnectSupervisor`]: bounded exponential backoff over connection state
//! - [`ReconciliationEngine`]: message lists and pending sends
//! - [`UnreadTracker`]: unread counts and latest-message summaries
//! - [`SyncCore`]: one session's worth of the above, wired together
//! - [`envelope`]: CBOR wire envelopes

#![forbid(unsafe_code)]

pub mod backoff;
pub mod env;
pub mod envelope;
pub mod error;
pub mod message;
pub mod reconcile;
pub mod supervisor;
pub mod sync;
pub mod unread;

pub use backoff::BackoffPolicy;
pub use env::Environment;
pub use envelope::{
    InboundEnvelope, MessageEnvelope, OutboundEnvelope, RawEvent, ReceiptEnvelope, Topic,
};
pub use error::{EngineError, EnvelopeError, SupervisorError, SyncError};
pub use message::{
    Content, ContentKind, ConversationId, CorrelationId, DeliveryState, Message, MessageId, UserId,
};
pub use reconcile::{PendingSendRecord, ReconcileOutcome, ReconciliationEngine, SendStatus};
pub use supervisor::{ConnectionState, ReconnectSupervisor, SupervisorAction};
pub use sync::{Notification, SyncAction, SyncConfig, SyncCore, SyncEvent};
pub use unread::{MessageSummary, UnreadEntry, UnreadTracker};

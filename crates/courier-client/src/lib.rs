//! Courier client
//!
//! Async session runtime around the Sans-IO [`courier_core`] state machines.
//!
//! # Architecture
//!
//! ```text
//! SyncHandle ──commands──> Runtime ──actions──> TransportConnection ──> Transport
//!     ^                      │  ^                        │
//!     │                      │  └──state / inbound───────┘
//!     └──── notifications ───┘
//! ```
//!
//! The runtime owns the [`SyncCore`](courier_core::SyncCore) behind a lock
//! and is the only writer. Handles read snapshots and receive push
//! notifications.
//!
//! # Components
//!
//! - [`SyncHandle`]: facade held by the rendering layer
//! - [`TransportConnection`]: connect/publish/subscribe over a [`Transport`]
//! - [`SessionConfig`]: timeouts, capacities, credentials
//! - [`SystemEnv`]: production [`Environment`](courier_core::Environment)

#![forbid(unsafe_code)]

mod config;
mod handle;
mod runtime;
mod system_env;
pub mod transport;

pub use config::{
    Credentials, DEFAULT_COMMAND_CAPACITY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_INBOUND_CAPACITY,
    DEFAULT_NOTIFICATION_CAPACITY, SessionConfig,
};
pub use courier_core::{
    ConnectionState, Content, ConversationId, CorrelationId, DeliveryState, Environment, Message,
    MessageSummary, Notification, UserId,
};
pub use handle::{SessionError, SyncHandle};
pub use system_env::SystemEnv;
pub use transport::{Link, Transport, TransportConnection, TransportError, TransportFrame};

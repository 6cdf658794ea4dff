//! Error types for the sync core.
//!
//! Strongly-typed errors per layer: envelope decoding, supervisor operations
//! and reconciliation engine lookups. None of these cross into the rendering
//! layer as failures; callers turn them into state (placeholder messages,
//! flags, logs).

use thiserror::Error;

use crate::{message::CorrelationId, supervisor::ConnectionState};

/// Errors produced while encoding or decoding wire envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Envelope exceeds the maximum accepted size.
    #[error("envelope too large: {size} bytes (max {max})")]
    TooLarge {
        /// Size of the received payload.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Payload is empty.
    #[error("empty envelope")]
    Empty,

    /// CBOR decoding failed.
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// CBOR encoding failed.
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// A field required to build a message is missing or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Content-kind tag not known to this client.
    #[error("unknown content kind: {0}")]
    UnknownKind(String),
}

/// Errors returned by the reconnection supervisor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// Operation not allowed in the current state.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current connection state when the error occurred.
        state: ConnectionState,
        /// Operation that was attempted.
        operation: &'static str,
    },
}

/// Errors returned by the reconciliation engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No pending send record exists for this correlation id.
    #[error("no pending send for {0}")]
    UnknownPending(CorrelationId),

    /// The message exists but is not in the failed state.
    #[error("message {0} has not failed")]
    NotFailed(CorrelationId),

    /// Placeholder content cannot be sent.
    #[error("unrecognized content cannot be sent")]
    Unsendable,
}

/// Errors returned by facade commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Reconciliation engine rejected the command.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Supervisor rejected the command.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl SyncError {
    /// Whether the session was shut down.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::Supervisor(SupervisorError::InvalidState { .. }))
    }
}

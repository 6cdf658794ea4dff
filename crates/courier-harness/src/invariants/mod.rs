//! Session invariants.
//!
//! A [`SystemSnapshot`] is captured from one or more
//! [`SyncCore`](courier_core::SyncCore)s and every registered [`Invariant`]
//! is run against it. Property and session tests call
//! [`InvariantRegistry::assert_all`] after each step.
//!
//! ```ignore
//! let snapshot = handle.inspect(SystemSnapshot::from_core);
//! InvariantRegistry::standard().assert_all(&snapshot, "after reconnect");
//! ```

mod checks;
mod snapshot;

use std::fmt;

pub use checks::{
    ActiveConversationRead, NoDuplicateServerIds, OneMessagePerSend, PendingRecordsBacked,
    UnreadTotalMatches,
};
pub use snapshot::{ConversationSnapshot, SessionSnapshot, SystemSnapshot};

/// Outcome of a single check.
pub type InvariantResult = Result<(), Violation>;

/// A broken invariant.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Which check failed.
    pub invariant: &'static str,
    /// Offending session and values.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of session state that holds after every event.
pub trait Invariant: Send + Sync {
    /// Stable name used in violation reports.
    fn name(&self) -> &'static str;

    /// Inspect the snapshot.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Ordered set of invariants.
#[derive(Default)]
pub struct InvariantRegistry {
    checks: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Every session invariant:
    /// [`NoDuplicateServerIds`], [`OneMessagePerSend`],
    /// [`PendingRecordsBacked`], [`UnreadTotalMatches`] and
    /// [`ActiveConversationRead`].
    pub fn standard() -> Self {
        Self::default()
            .with(NoDuplicateServerIds)
            .with(OneMessagePerSend)
            .with(PendingRecordsBacked)
            .with(UnreadTotalMatches)
            .with(ActiveConversationRead)
    }

    /// Append a check.
    #[must_use]
    pub fn with<I: Invariant + 'static>(mut self, invariant: I) -> Self {
        self.checks.push(Box::new(invariant));
        self
    }

    /// Names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.checks.iter().map(|check| check.name())
    }

    /// Run every check and collect all violations.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.checks.iter().filter_map(|check| check.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Panic listing every violation, tagged with `context`.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let lines: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("invariants broken {context}:\n  {}", lines.join("\n  "));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use courier_core::{ConnectionState, ConversationId, SyncConfig, SyncCore, UserId};

    use super::*;
    use crate::SimEnv;

    #[test]
    fn standard_registry_runs_in_order() {
        let names: Vec<_> = InvariantRegistry::standard().names().collect();
        assert_eq!(
            names,
            [
                "no_duplicate_server_ids",
                "one_message_per_send",
                "pending_records_backed",
                "unread_total_matches",
                "active_conversation_read",
            ]
        );
    }

    #[test]
    fn every_violation_is_reported() {
        let c1 = ConversationId::from("C1");
        let mut conversations = BTreeMap::new();
        conversations.insert(c1.clone(), ConversationSnapshot { messages: Vec::new(), unread: 2 });
        let session = SessionSnapshot {
            user: UserId::new("alice"),
            conversations,
            pending_records: Vec::new(),
            active: Some(c1),
            total_unread: 0,
            connection: ConnectionState::Connected,
            offline: false,
        };

        let violations = InvariantRegistry::standard()
            .check_all(&SystemSnapshot::empty().with_session(session))
            .unwrap_err();
        let broken: Vec<_> = violations.iter().map(|v| v.invariant).collect();
        assert_eq!(broken, ["unread_total_matches", "active_conversation_read"]);
    }

    #[test]
    fn fresh_session_passes_invariants() {
        let core = SyncCore::new(SimEnv::new(), SyncConfig::new("alice"));
        let snapshot = SystemSnapshot::from_core(&core);
        InvariantRegistry::standard().assert_all(&snapshot, "fresh session");
        assert!(InvariantRegistry::standard().check_all(&SystemSnapshot::empty()).is_ok());
    }
}

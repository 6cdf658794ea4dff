//! Observable session state for invariant checking.

use std::collections::BTreeMap;

use courier_core::{
    ConnectionState, ConversationId, Environment, Message, PendingSendRecord, SyncCore, UserId,
};

/// One conversation as the session sees it.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    /// Messages in display order.
    pub messages: Vec<Message>,
    /// Unread count.
    pub unread: u32,
}

/// One signed-in session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Local user.
    pub user: UserId,
    /// Every conversation with messages or read state.
    pub conversations: BTreeMap<ConversationId, ConversationSnapshot>,
    /// Pending sends in enqueue order.
    pub pending_records: Vec<PendingSendRecord>,
    /// Conversation being viewed.
    pub active: Option<ConversationId>,
    /// Reported total unread.
    pub total_unread: u64,
    /// Connection state.
    pub connection: ConnectionState,
    /// Offline signal.
    pub offline: bool,
}

impl SessionSnapshot {
    /// Capture the state of a sync core.
    pub fn from_core<E: Environment>(core: &SyncCore<E>) -> Self {
        let mut conversations: BTreeMap<ConversationId, ConversationSnapshot> = BTreeMap::new();

        for conversation_id in core.engine().conversations() {
            conversations.entry(conversation_id.clone()).or_default().messages =
                core.messages_of(conversation_id).to_vec();
        }
        for (conversation_id, entry) in core.unread().iter() {
            conversations.entry(conversation_id.clone()).or_default().unread = entry.unread;
        }

        Self {
            user: core.local_user().clone(),
            conversations,
            pending_records: core.pending_records().cloned().collect(),
            active: core.active_conversation().cloned(),
            total_unread: core.total_unread(),
            connection: core.connection_state(),
            offline: core.is_offline(),
        }
    }
}

/// Snapshot of every session under test.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Sessions in no particular order.
    pub sessions: Vec<SessionSnapshot>,
}

impl SystemSnapshot {
    /// No sessions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of a single session.
    pub fn from_core<E: Environment>(core: &SyncCore<E>) -> Self {
        Self { sessions: vec![SessionSnapshot::from_core(core)] }
    }

    /// Add a session.
    #[must_use]
    pub fn with_session(mut self, session: SessionSnapshot) -> Self {
        self.sessions.push(session);
        self
    }
}

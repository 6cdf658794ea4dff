//! Unread counters and latest-message summaries.
//!
//! Counts are kept independently of the message lists and are never
//! recomputed from them. Only [`UnreadTracker::on_inbound_message`] and
//! [`UnreadTracker::mark_read`] change a count.

use std::collections::HashMap;

use tracing::trace;

use crate::message::{ConversationId, UserId};

/// Characters kept in a summary preview.
pub const PREVIEW_CHARS: usize = 80;

/// Latest-message summary for conversation lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    /// Short preview of the content.
    pub preview: String,
    /// Author.
    pub sender_id: UserId,
    /// Send time in Unix milliseconds.
    pub sent_at_ms: u64,
}

/// Per-conversation read state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadEntry {
    /// Messages from others received since the last read.
    pub unread: u32,
    /// Last time the conversation was marked read.
    pub last_read_ms: Option<u64>,
    /// Most recent inbound message.
    pub latest: Option<MessageSummary>,
}

/// Unread/read tracker.
#[derive(Debug, Clone, Default)]
pub struct UnreadTracker {
    entries: HashMap<ConversationId, UnreadEntry>,
    active: Option<ConversationId>,
}

impl UnreadTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A newly inserted inbound message.
    ///
    /// Refreshes the summary. Increments the count unless the local user sent
    /// it or the conversation is being viewed. Returns the new count.
    pub fn on_inbound_message(
        &mut self,
        conversation_id: &ConversationId,
        is_self: bool,
        summary: MessageSummary,
    ) -> u32 {
        let counts = !is_self && self.active.as_ref() != Some(conversation_id);
        let entry = self.entries.entry(conversation_id.clone()).or_default();

        entry.latest = Some(summary);
        if counts {
            entry.unread = entry.unread.saturating_add(1);
        }

        trace!(conversation = %conversation_id, unread = entry.unread, "inbound message");
        entry.unread
    }

    /// Reset the count and stamp the read time. Idempotent.
    ///
    /// Returns `true` if the count changed.
    pub fn mark_read(&mut self, conversation_id: &ConversationId, now_ms: u64) -> bool {
        let entry = self.entries.entry(conversation_id.clone()).or_default();
        let changed = entry.unread != 0;
        entry.unread = 0;
        entry.last_read_ms = Some(now_ms);
        changed
    }

    /// Unread count of a conversation.
    pub fn unread_of(&self, conversation_id: &ConversationId) -> u32 {
        self.entries.get(conversation_id).map_or(0, |entry| entry.unread)
    }

    /// Sum of all unread counts.
    pub fn total_unread(&self) -> u64 {
        self.entries.values().map(|entry| u64::from(entry.unread)).sum()
    }

    /// Read state of a conversation.
    pub fn entry(&self, conversation_id: &ConversationId) -> Option<&UnreadEntry> {
        self.entries.get(conversation_id)
    }

    /// Every tracked conversation.
    pub fn iter(&self) -> impl Iterator<Item = (&ConversationId, &UnreadEntry)> {
        self.entries.iter()
    }

    /// Latest-message summary of a conversation.
    pub fn latest_of(&self, conversation_id: &ConversationId) -> Option<&MessageSummary> {
        self.entries.get(conversation_id)?.latest.as_ref()
    }

    /// Select the conversation being viewed (`None` for none).
    pub fn set_active(&mut self, conversation_id: Option<ConversationId>) {
        self.active = conversation_id;
    }

    /// Conversation being viewed.
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }
}

//! Message reconciliation engine.
//!
//! Owns every conversation's message list and the queue of pending sends. The
//! central job is turning an optimistic local message into its confirmed
//! server counterpart without ever showing both.
//!
//! # Matching
//!
//! An inbound confirmed message is placed by the first rule that applies:
//!
//! 1. a message with the same server id already exists: duplicate, no-op
//! 2. a confirmed message already carries its correlation id: duplicate
//! 3. its correlation id names a pending or failed local message: replace
//! 4. it comes from the local user, its correlation id is absent or names no
//!    queued send, and its content fingerprint equals a still-pending local
//!    message: replace the OLDEST such message
//! 5. otherwise: insert at the newest end
//!
//! Ambiguity always resolves to insertion. Showing a message twice is
//! recoverable, losing one is not.
//!
//! Whichever rule places it, a confirmation carrying the correlation id of a
//! queued send settles that send: its record is dropped.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::{
    envelope::{InboundEnvelope, MessageEnvelope, RawEvent, Topic},
    error::{EngineError, EnvelopeError},
    message::{
        Content, ConversationId, CorrelationId, DeliveryState, Message, MessageId, UserId,
    },
};

/// Prefix of ids synthesized for placeholders without a server id.
pub const UNPARSED_PREFIX: &str = "unparsed-";

/// Sender recorded on placeholders whose envelope names none.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Where a pending send is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Waiting for a connection.
    Queued,
    /// Handed to the transport, awaiting confirmation.
    InFlight,
}

/// Bookkeeping for one optimistic send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSendRecord {
    /// Correlation id (also the pending message id).
    pub correlation_id: CorrelationId,
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Payload to publish.
    pub content: Content,
    /// Publish attempts so far.
    pub attempts: u32,
    /// Wall-clock time the send was queued.
    pub enqueued_at_ms: u64,
    /// Lifecycle status.
    pub status: SendStatus,
}

/// What an inbound event did to the message lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new message was appended.
    Inserted {
        /// Conversation that changed.
        conversation_id: ConversationId,
        /// Index of the new message.
        index: usize,
        /// Whether the local user sent it (from another device).
        from_self: bool,
    },
    /// A pending message was replaced by its confirmation.
    Replaced {
        /// Conversation that changed.
        conversation_id: ConversationId,
        /// Index of the replaced message.
        index: usize,
        /// Correlation id of the reconciled send.
        correlation_id: CorrelationId,
        /// `true` for a correlation-id match, `false` for a fingerprint match.
        exact: bool,
    },
    /// Already known; nothing changed.
    Duplicate {
        /// Conversation the duplicate belongs to.
        conversation_id: ConversationId,
    },
    /// A receipt advanced a message's delivery state.
    ReceiptApplied {
        /// Conversation that changed.
        conversation_id: ConversationId,
        /// Index of the updated message.
        index: usize,
    },
    /// Event dropped (no conversation, or a receipt that changes nothing).
    Ignored,
}

impl ReconcileOutcome {
    /// Conversation whose message list changed, if any.
    pub fn changed_conversation(&self) -> Option<&ConversationId> {
        match self {
            Self::Inserted { conversation_id, .. }
            | Self::Replaced { conversation_id, .. }
            | Self::ReceiptApplied { conversation_id, .. } => Some(conversation_id),
            Self::Duplicate { .. } | Self::Ignored => None,
        }
    }
}

/// Message lists plus the pending-send queue.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    local_user: UserId,
    /// Oldest-first per conversation.
    conversations: HashMap<ConversationId, Vec<Message>>,
    /// Enqueue order.
    records: VecDeque<PendingSendRecord>,
    next_unparsed: u64,
}

impl ReconciliationEngine {
    /// Create an empty engine for `local_user`.
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            conversations: HashMap::new(),
            records: VecDeque::new(),
            next_unparsed: 0,
        }
    }

    /// The local user.
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Messages of a conversation, oldest first. Empty if unknown.
    pub fn messages_of(&self, conversation_id: &ConversationId) -> &[Message] {
        self.conversations.get(conversation_id).map_or(&[], Vec::as_slice)
    }

    /// Conversations currently held in memory.
    pub fn conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.conversations.keys()
    }

    /// Pending-send records in enqueue order.
    pub fn pending_records(&self) -> impl Iterator<Item = &PendingSendRecord> {
        self.records.iter()
    }

    /// Record for `correlation_id`.
    pub fn record(&self, correlation_id: &CorrelationId) -> Option<&PendingSendRecord> {
        self.records.iter().find(|record| &record.correlation_id == correlation_id)
    }

    /// Optimistic send: append a pending message and queue a record.
    ///
    /// # Errors
    ///
    /// - `EngineError::Unsendable` for placeholder content
    pub fn send_message(
        &mut self,
        conversation_id: ConversationId,
        content: Content,
        correlation_id: CorrelationId,
        now_ms: u64,
    ) -> Result<Message, EngineError> {
        if content.is_unrecognized() {
            return Err(EngineError::Unsendable);
        }

        let message = Message {
            id: MessageId::Pending(correlation_id.clone()),
            conversation_id: conversation_id.clone(),
            sender_id: self.local_user.clone(),
            content: content.clone(),
            sent_at_ms: now_ms,
            delivery: DeliveryState::Pending,
            correlation_id: Some(correlation_id.clone()),
        };

        self.conversations.entry(conversation_id.clone()).or_default().push(message.clone());
        self.records.push_back(PendingSendRecord {
            correlation_id,
            conversation_id,
            content,
            attempts: 0,
            enqueued_at_ms: now_ms,
            status: SendStatus::Queued,
        });

        debug!(id = %message.id, conversation = %message.conversation_id, "queued send");
        Ok(message)
    }

    /// Apply a raw transport event.
    pub fn on_inbound(&mut self, event: &RawEvent, now_ms: u64) -> ReconcileOutcome {
        match InboundEnvelope::decode(&event.payload) {
            Ok(InboundEnvelope::Message(envelope)) => {
                self.on_message_envelope(&event.topic, &envelope, now_ms)
            },
            Ok(InboundEnvelope::Receipt(receipt)) => self.on_receipt(
                &ConversationId::new(receipt.conversation_id),
                &receipt.server_id,
                receipt.state,
            ),
            Err(err) => {
                let Some(conversation_id) = event.topic.conversation_id().cloned() else {
                    warn!(topic = %event.topic, error = %err, "dropping undecodable event");
                    return ReconcileOutcome::Ignored;
                };
                self.insert_placeholder(conversation_id, None, None, None, &err, now_ms)
            },
        }
    }

    fn on_message_envelope(
        &mut self,
        topic: &Topic,
        envelope: &MessageEnvelope,
        now_ms: u64,
    ) -> ReconcileOutcome {
        let conversation_id = envelope
            .conversation_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(ConversationId::new)
            .or_else(|| topic.conversation_id().cloned());

        let Some(conversation_id) = conversation_id else {
            warn!(%topic, "dropping message without a conversation");
            return ReconcileOutcome::Ignored;
        };

        match envelope.to_message(conversation_id.clone(), &self.local_user, now_ms) {
            Ok(message) => self.reconcile(message),
            Err(err) => self.insert_placeholder(
                conversation_id,
                envelope.server_id.as_deref(),
                envelope.sender_id.as_deref(),
                envelope.timestamp_ms,
                &err,
                now_ms,
            ),
        }
    }

    /// Place a confirmed message.
    pub fn reconcile(&mut self, message: Message) -> ReconcileOutcome {
        let conversation_id = message.conversation_id.clone();
        let messages = self.conversations.entry(conversation_id.clone()).or_default();

        if let Some(server_id) = message.id.server_id() {
            if messages.iter().any(|m| m.id.server_id() == Some(server_id)) {
                trace!(server_id, "duplicate delivery");
                return ReconcileOutcome::Duplicate { conversation_id };
            }
        }

        if let Some(correlation_id) = &message.correlation_id {
            let already_confirmed = messages
                .iter()
                .any(|m| m.is_confirmed() && m.correlation_id.as_ref() == Some(correlation_id));
            if already_confirmed {
                trace!(%correlation_id, "send already confirmed");
                return ReconcileOutcome::Duplicate { conversation_id };
            }
        }

        let exact = message.correlation_id.as_ref().and_then(|correlation_id| {
            messages
                .iter()
                .position(|m| {
                    matches!(&m.id, MessageId::Pending(id) if id == correlation_id)
                        && matches!(m.delivery, DeliveryState::Pending | DeliveryState::Failed)
                })
                .map(|index| (index, correlation_id.clone(), true))
        });

        // A correlation id naming a queued send is never matched by content.
        let names_record = message
            .correlation_id
            .as_ref()
            .is_some_and(|id| self.records.iter().any(|record| &record.correlation_id == id));

        let matched = exact.or_else(|| {
            if names_record || message.sender_id != self.local_user {
                return None;
            }
            let fingerprint = message.content.fingerprint()?;
            messages.iter().enumerate().find_map(|(index, m)| match &m.id {
                MessageId::Pending(id)
                    if m.delivery == DeliveryState::Pending
                        && m.sender_id == self.local_user
                        && m.content.fingerprint() == Some(fingerprint) =>
                {
                    Some((index, id.clone(), false))
                },
                _ => None,
            })
        });

        let Some((index, correlation_id, exact)) = matched else {
            let from_self = message.sender_id == self.local_user;
            let settled = message.correlation_id.clone().filter(|_| names_record);
            messages.push(message);
            let index = messages.len() - 1;
            debug!(conversation = %conversation_id, index, from_self, "inserted message");

            if let Some(correlation_id) = settled {
                self.settle_elsewhere(&conversation_id, &correlation_id);
            }
            return ReconcileOutcome::Inserted { conversation_id, index, from_self };
        };

        let mut confirmed = message;
        confirmed.correlation_id = Some(correlation_id.clone());
        debug!(
            conversation = %conversation_id,
            pending = %correlation_id,
            confirmed = %confirmed.id,
            exact,
            "reconciled pending message"
        );
        messages[index] = confirmed;
        self.records.retain(|record| record.correlation_id != correlation_id);

        ReconcileOutcome::Replaced { conversation_id, index, correlation_id, exact }
    }

    /// A send confirmed into a conversation other than the one it was queued
    /// for: drop its record and its stale pending copy.
    fn settle_elsewhere(&mut self, placed_in: &ConversationId, correlation_id: &CorrelationId) {
        self.records.retain(|record| &record.correlation_id != correlation_id);
        for (conversation_id, messages) in &mut self.conversations {
            if conversation_id != placed_in {
                messages
                    .retain(|m| !matches!(&m.id, MessageId::Pending(id) if id == correlation_id));
            }
        }
        debug!(%correlation_id, conversation = %placed_in, "send confirmed elsewhere");
    }

    fn insert_placeholder(
        &mut self,
        conversation_id: ConversationId,
        server_id: Option<&str>,
        sender_id: Option<&str>,
        timestamp_ms: Option<u64>,
        reason: &EnvelopeError,
        now_ms: u64,
    ) -> ReconcileOutcome {
        let server_id = server_id.filter(|id| !id.is_empty());
        let messages = self.conversations.entry(conversation_id.clone()).or_default();

        if let Some(server_id) = server_id {
            if messages.iter().any(|m| m.id.server_id() == Some(server_id)) {
                return ReconcileOutcome::Duplicate { conversation_id };
            }
        }

        let id = match server_id {
            Some(id) => id.to_owned(),
            None => {
                let id = format!("{UNPARSED_PREFIX}{}", self.next_unparsed);
                self.next_unparsed += 1;
                id
            },
        };

        let sender_id =
            UserId::new(sender_id.filter(|id| !id.is_empty()).unwrap_or(UNKNOWN_SENDER));
        let from_self = sender_id == self.local_user;

        warn!(conversation = %conversation_id, %id, error = %reason, "inserting placeholder");

        messages.push(Message {
            id: MessageId::Server(id),
            conversation_id: conversation_id.clone(),
            sender_id,
            content: Content::Unrecognized { reason: reason.to_string() },
            sent_at_ms: timestamp_ms.unwrap_or(now_ms),
            delivery: if from_self { DeliveryState::Sent } else { DeliveryState::Delivered },
            correlation_id: None,
        });

        ReconcileOutcome::Inserted { conversation_id, index: messages.len() - 1, from_self }
    }

    /// Apply a delivery receipt. Only moves own confirmed messages forward.
    pub fn on_receipt(
        &mut self,
        conversation_id: &ConversationId,
        server_id: &str,
        state: DeliveryState,
    ) -> ReconcileOutcome {
        let Some(messages) = self.conversations.get_mut(conversation_id) else {
            return ReconcileOutcome::Ignored;
        };

        let Some(index) = messages.iter().position(|m| m.id.server_id() == Some(server_id)) else {
            trace!(server_id, "receipt for unknown message");
            return ReconcileOutcome::Ignored;
        };

        let message = &mut messages[index];
        if message.sender_id != self.local_user || !message.delivery.can_advance_to(state) {
            return ReconcileOutcome::Ignored;
        }

        message.delivery = state;
        ReconcileOutcome::ReceiptApplied { conversation_id: conversation_id.clone(), index }
    }

    /// Record an accepted publish of `correlation_id`.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPending` if no record exists (already confirmed)
    pub fn publish_succeeded(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<u32, EngineError> {
        let record = self.record_mut(correlation_id)?;
        record.attempts = record.attempts.saturating_add(1);
        record.status = SendStatus::InFlight;
        Ok(record.attempts)
    }

    /// Record a rejected publish of `correlation_id`.
    ///
    /// Returns `true` when the attempt budget is spent and the message was
    /// marked failed.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPending` if no record exists
    pub fn publish_failed(
        &mut self,
        correlation_id: &CorrelationId,
        max_attempts: u32,
    ) -> Result<bool, EngineError> {
        let record = self.record_mut(correlation_id)?;
        record.attempts = record.attempts.saturating_add(1);
        record.status = SendStatus::Queued;

        if record.attempts >= max_attempts {
            self.mark_failed(correlation_id)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Give up on a send: drop its record and flag the message failed.
    ///
    /// The message stays visible so the user can retry it.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPending` if no record exists
    pub fn mark_failed(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<ConversationId, EngineError> {
        let position = self
            .records
            .iter()
            .position(|record| &record.correlation_id == correlation_id)
            .ok_or_else(|| EngineError::UnknownPending(correlation_id.clone()))?;

        let Some(record) = self.records.remove(position) else {
            return Err(EngineError::UnknownPending(correlation_id.clone()));
        };

        if let Some(message) = self.pending_message_mut(&record.conversation_id, correlation_id) {
            message.delivery = DeliveryState::Failed;
        }

        warn!(%correlation_id, attempts = record.attempts, "send failed");
        Ok(record.conversation_id)
    }

    /// Re-enter the send path for a failed message.
    ///
    /// Same correlation id, message back to pending, fresh record at the back
    /// of the queue.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownPending` if no such local message exists
    /// - `EngineError::NotFailed` if the message has not failed
    pub fn retry_failed(
        &mut self,
        correlation_id: &CorrelationId,
        now_ms: u64,
    ) -> Result<PendingSendRecord, EngineError> {
        let message = self
            .conversations
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|m| matches!(&m.id, MessageId::Pending(id) if id == correlation_id))
            .ok_or_else(|| EngineError::UnknownPending(correlation_id.clone()))?;

        if message.delivery != DeliveryState::Failed {
            return Err(EngineError::NotFailed(correlation_id.clone()));
        }

        message.delivery = DeliveryState::Pending;
        let record = PendingSendRecord {
            correlation_id: correlation_id.clone(),
            conversation_id: message.conversation_id.clone(),
            content: message.content.clone(),
            attempts: 0,
            enqueued_at_ms: now_ms,
            status: SendStatus::Queued,
        };
        self.records.push_back(record.clone());

        debug!(%correlation_id, "retrying failed send");
        Ok(record)
    }

    /// Load older confirmed messages at the oldest end.
    ///
    /// `history` is oldest-first. Pending messages and server ids already
    /// present are skipped. Returns how many were added.
    pub fn seed_history(
        &mut self,
        conversation_id: &ConversationId,
        history: Vec<Message>,
    ) -> usize {
        let messages = self.conversations.entry(conversation_id.clone()).or_default();

        let mut older: Vec<Message> = Vec::with_capacity(history.len());
        for message in history {
            let Some(server_id) = message.id.server_id() else { continue };
            if &message.conversation_id != conversation_id {
                continue;
            }
            let known =
                messages.iter().chain(older.iter()).any(|m| m.id.server_id() == Some(server_id));
            if !known {
                older.push(message);
            }
        }

        let added = older.len();
        if added > 0 {
            messages.splice(0..0, older);
            debug!(conversation = %conversation_id, added, "seeded history");
        }
        added
    }

    /// Drop a conversation's messages from memory.
    ///
    /// Unconfirmed sends stay, together with their records, so they still
    /// flush on reconnect and their confirmations replace them. Returns
    /// whether anything was dropped.
    pub fn evict(&mut self, conversation_id: &ConversationId) -> bool {
        let Some(messages) = self.conversations.get_mut(conversation_id) else {
            return false;
        };

        let before = messages.len();
        messages.retain(Message::is_pending);
        let dropped = before - messages.len();
        if messages.is_empty() {
            self.conversations.remove(conversation_id);
        }

        debug!(conversation = %conversation_id, dropped, "evicted conversation");
        dropped > 0
    }

    fn record_mut(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<&mut PendingSendRecord, EngineError> {
        self.records
            .iter_mut()
            .find(|record| &record.correlation_id == correlation_id)
            .ok_or_else(|| EngineError::UnknownPending(correlation_id.clone()))
    }

    fn pending_message_mut(
        &mut self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
    ) -> Option<&mut Message> {
        self.conversations
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| matches!(&m.id, MessageId::Pending(id) if id == correlation_id))
    }
}

//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use std::collections::{HashMap, HashSet};

use courier_core::{DeliveryState, MessageId};

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// A server id appears at most once per conversation.
///
/// Redelivered events must be absorbed, never appended.
pub struct NoDuplicateServerIds;

impl Invariant for NoDuplicateServerIds {
    fn name(&self) -> &'static str {
        "no_duplicate_server_ids"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            for (conversation_id, conversation) in &session.conversations {
                let mut seen = HashSet::new();
                for server_id in conversation.messages.iter().filter_map(|m| m.id.server_id()) {
                    if !seen.insert(server_id) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "session {} conversation {}: server id {} listed twice",
                                session.user, conversation_id, server_id
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// One visible message per logical send.
///
/// A correlation id is carried by at most one message, pending or confirmed.
/// A confirmed copy next to its pending original means the replacement
/// appended instead of replacing.
pub struct OneMessagePerSend;

impl Invariant for OneMessagePerSend {
    fn name(&self) -> &'static str {
        "one_message_per_send"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            for (conversation_id, conversation) in &session.conversations {
                let mut counts: HashMap<&str, usize> = HashMap::new();
                for message in &conversation.messages {
                    if let Some(correlation_id) = &message.correlation_id {
                        *counts.entry(correlation_id.as_str()).or_default() += 1;
                    }
                }

                let repeated = counts.iter().find(|(_, count)| **count > 1);
                if let Some((correlation_id, count)) = repeated {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "session {} conversation {}: correlation id {} on {} messages",
                            session.user, conversation_id, correlation_id, count
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Pending-send records and pending messages agree.
///
/// Every record points at a message still awaiting confirmation, and every
/// pending message has a record. Conversations dropped from memory keep
/// their records, so those are skipped.
pub struct PendingRecordsBacked;

impl Invariant for PendingRecordsBacked {
    fn name(&self) -> &'static str {
        "pending_records_backed"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            for record in &session.pending_records {
                let Some(conversation) = session.conversations.get(&record.conversation_id) else {
                    continue;
                };
                let backed = conversation.messages.iter().any(|m| {
                    matches!(&m.id, MessageId::Pending(id) if id == &record.correlation_id)
                        && m.delivery == DeliveryState::Pending
                });
                if !backed {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "session {}: record {} has no pending message in {}",
                            session.user, record.correlation_id, record.conversation_id
                        ),
                    });
                }
            }

            for (conversation_id, conversation) in &session.conversations {
                for message in conversation.messages.iter().filter(|m| m.id.is_pending()) {
                    let MessageId::Pending(correlation_id) = &message.id else {
                        continue;
                    };
                    let has_record =
                        session.pending_records.iter().any(|r| &r.correlation_id == correlation_id);
                    let failed = message.delivery == DeliveryState::Failed;
                    if has_record == failed {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "session {} conversation {}: message {} is {:?} with record={}",
                                session.user,
                                conversation_id,
                                correlation_id,
                                message.delivery,
                                has_record
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// The reported total equals the sum of per-conversation counts.
pub struct UnreadTotalMatches;

impl Invariant for UnreadTotalMatches {
    fn name(&self) -> &'static str {
        "unread_total_matches"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            let sum: u64 = session.conversations.values().map(|c| u64::from(c.unread)).sum();
            if sum != session.total_unread {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "session {}: total {} but conversations sum to {}",
                        session.user, session.total_unread, sum
                    ),
                });
            }
        }
        Ok(())
    }
}

/// The conversation being viewed has nothing unread.
pub struct ActiveConversationRead;

impl Invariant for ActiveConversationRead {
    fn name(&self) -> &'static str {
        "active_conversation_read"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for session in &state.sessions {
            let Some(active) = &session.active else {
                continue;
            };
            let unread = session.conversations.get(active).map_or(0, |c| c.unread);
            if unread != 0 {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "session {}: active conversation {} has {} unread",
                        session.user, active, unread
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use courier_core::{
        ConnectionState, Content, ConversationId, CorrelationId, Message, UserId,
    };

    use super::*;
    use crate::invariants::{ConversationSnapshot, SessionSnapshot};

    fn confirmed(server_id: &str, correlation_id: Option<&str>) -> Message {
        Message {
            id: MessageId::Server(server_id.into()),
            conversation_id: ConversationId::new("C1"),
            sender_id: UserId::new("alice"),
            content: Content::text("hi"),
            sent_at_ms: 1,
            delivery: DeliveryState::Sent,
            correlation_id: correlation_id.map(CorrelationId::from_wire),
        }
    }

    fn session(messages: Vec<Message>, unread: u32, total: u64) -> SystemSnapshot {
        let mut conversations = BTreeMap::new();
        conversations.insert(ConversationId::new("C1"), ConversationSnapshot { messages, unread });
        SystemSnapshot::empty().with_session(SessionSnapshot {
            user: UserId::new("alice"),
            conversations,
            pending_records: Vec::new(),
            active: None,
            total_unread: total,
            connection: ConnectionState::Connected,
            offline: false,
        })
    }

    #[test]
    fn duplicate_server_id_is_flagged() {
        let state = session(vec![confirmed("s1", None), confirmed("s1", None)], 0, 0);
        assert!(NoDuplicateServerIds.check(&state).is_err());
    }

    #[test]
    fn duplicate_correlation_is_flagged() {
        let state = session(vec![confirmed("s1", Some("c1")), confirmed("s2", Some("c1"))], 0, 0);
        assert!(OneMessagePerSend.check(&state).is_err());
        assert!(NoDuplicateServerIds.check(&state).is_ok());
    }

    #[test]
    fn pending_message_without_record_is_flagged() {
        let mut pending = confirmed("unused", Some("c1"));
        pending.id = MessageId::Pending(CorrelationId::from_wire("c1"));
        pending.delivery = DeliveryState::Pending;

        let state = session(vec![pending], 0, 0);
        assert!(PendingRecordsBacked.check(&state).is_err());
    }

    #[test]
    fn unread_mismatch_is_flagged() {
        assert!(UnreadTotalMatches.check(&session(vec![], 2, 2)).is_ok());
        assert!(UnreadTotalMatches.check(&session(vec![], 2, 3)).is_err());
    }

    #[test]
    fn active_conversation_with_unread_is_flagged() {
        let mut state = session(vec![], 1, 1);
        state.sessions[0].active = Some(ConversationId::new("C1"));
        assert!(ActiveConversationRead.check(&state).is_err());
    }
}

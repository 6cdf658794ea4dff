//! Conversation synchronization core.
//!
//! [`SyncCore`] wires the supervisor, the reconciliation engine and the unread
//! tracker together. Every event updates all three before any notification is
//! produced, so observers never see a message list and an unread count from
//! different points in time.
//!
//! Like the components it owns, `SyncCore` performs no I/O. The runtime feeds
//! it [`SyncEvent`]s and user commands and executes the returned
//! [`SyncAction`]s.

use std::{collections::BTreeSet, time::Duration};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    backoff::BackoffPolicy,
    env::Environment,
    envelope::{OutboundEnvelope, RawEvent, Topic},
    error::{EngineError, SyncError},
    message::{Content, ConversationId, CorrelationId, Message, UserId},
    reconcile::{PendingSendRecord, ReconcileOutcome, ReconciliationEngine, SendStatus},
    supervisor::{ConnectionState, ReconnectSupervisor, SupervisorAction},
    unread::{MessageSummary, PREVIEW_CHARS, UnreadTracker},
};

/// Publish attempts per send before it is marked failed.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;

/// Wait before republishing sends the transport rejected while connected.
pub const DEFAULT_RESEND_DELAY: Duration = Duration::from_secs(1);

/// Sync core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// The signed-in user.
    pub local_user: UserId,
    /// Reconnect schedule.
    pub backoff: BackoffPolicy,
    /// Publish attempts per send before it is marked failed.
    pub max_send_attempts: u32,
    /// Wait before republishing rejected sends on a live connection.
    pub resend_delay: Duration,
}

impl SyncConfig {
    /// Defaults for `local_user`.
    pub fn new(local_user: impl Into<UserId>) -> Self {
        Self {
            local_user: local_user.into(),
            backoff: BackoffPolicy::default(),
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            resend_delay: DEFAULT_RESEND_DELAY,
        }
    }
}

/// Inputs from the transport and timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Transport reported a state transition.
    ConnectionChanged(ConnectionState),
    /// Transport delivered an event.
    Inbound(RawEvent),
    /// Retry timer of `generation` fired.
    RetryElapsed {
        /// Generation from the matching [`SyncAction::ScheduleRetry`].
        generation: u64,
    },
    /// Resend timer from [`SyncAction::ScheduleResend`] fired.
    ResendElapsed,
    /// Outcome of a [`SyncAction::Publish`].
    PublishResult {
        /// Send that was published.
        correlation_id: CorrelationId,
        /// Whether the transport accepted it.
        accepted: bool,
    },
}

/// Push notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A conversation's message list changed.
    ConversationUpdated(ConversationId),
    /// A conversation's unread count changed.
    UnreadChanged {
        /// Conversation.
        conversation_id: ConversationId,
        /// New count.
        unread: u32,
        /// New total across conversations.
        total: u64,
    },
    /// Connection state changed.
    ConnectionChanged(ConnectionState),
    /// Automatic retries exhausted (`true`) or recovered (`false`).
    OfflineChanged(bool),
    /// Inbound events were lost before they could be applied. Message lists
    /// may have gaps until history is reloaded.
    InboundLagged {
        /// Number of events lost.
        skipped: u64,
    },
    /// A send ran out of attempts.
    SendFailed {
        /// Conversation of the failed message.
        conversation_id: ConversationId,
        /// Failed send.
        correlation_id: CorrelationId,
    },
}

/// Actions for the runtime to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Start a connection attempt.
    Connect,
    /// Tear down the connection.
    Disconnect,
    /// Arm the retry timer; report expiry as [`SyncEvent::RetryElapsed`].
    ScheduleRetry {
        /// Time to wait.
        delay: Duration,
        /// Generation to report back.
        generation: u64,
    },
    /// Disarm the retry timer.
    CancelRetry,
    /// Arm the resend timer; report expiry as [`SyncEvent::ResendElapsed`].
    /// Re-arming restarts it.
    ScheduleResend {
        /// Time to wait.
        delay: Duration,
    },
    /// Subscribe to a topic.
    Subscribe(Topic),
    /// Publish an outbound envelope; report [`SyncEvent::PublishResult`].
    Publish {
        /// Send being published.
        correlation_id: CorrelationId,
        /// Destination.
        topic: Topic,
        /// Encoded [`OutboundEnvelope`].
        payload: Bytes,
    },
    /// Deliver to observers.
    Notify(Notification),
}

/// Session-wide sync state machine.
pub struct SyncCore<E: Environment> {
    env: E,
    config: SyncConfig,
    supervisor: ReconnectSupervisor,
    engine: ReconciliationEngine,
    unread: UnreadTracker,
    /// Conversation topics re-subscribed on every connect.
    subscriptions: BTreeSet<ConversationId>,
}

impl<E: Environment> SyncCore<E> {
    /// Create a disconnected core.
    pub fn new(env: E, config: SyncConfig) -> Self {
        Self {
            supervisor: ReconnectSupervisor::new(config.backoff),
            engine: ReconciliationEngine::new(config.local_user.clone()),
            unread: UnreadTracker::new(),
            subscriptions: BTreeSet::new(),
            env,
            config,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The signed-in user.
    pub fn local_user(&self) -> &UserId {
        &self.config.local_user
    }

    /// Messages of a conversation, oldest first.
    pub fn messages_of(&self, conversation_id: &ConversationId) -> &[Message] {
        self.engine.messages_of(conversation_id)
    }

    /// Unread count of a conversation.
    pub fn unread_of(&self, conversation_id: &ConversationId) -> u32 {
        self.unread.unread_of(conversation_id)
    }

    /// Sum of unread counts.
    pub fn total_unread(&self) -> u64 {
        self.unread.total_unread()
    }

    /// Latest-message summary of a conversation.
    pub fn latest_of(&self, conversation_id: &ConversationId) -> Option<&MessageSummary> {
        self.unread.latest_of(conversation_id)
    }

    /// Last observed connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Whether automatic retries are exhausted.
    pub fn is_offline(&self) -> bool {
        self.supervisor.is_offline()
    }

    /// Conversation being viewed.
    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.unread.active()
    }

    /// Pending sends in enqueue order.
    pub fn pending_records(&self) -> impl Iterator<Item = &PendingSendRecord> {
        self.engine.pending_records()
    }

    /// Topics subscribed on connect: the user topic, then every conversation.
    pub fn topics(&self) -> Vec<Topic> {
        std::iter::once(Topic::User(self.config.local_user.clone()))
            .chain(self.subscriptions.iter().cloned().map(Topic::Conversation))
            .collect()
    }

    /// Reconciliation engine.
    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Unread tracker.
    pub fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    /// Begin connecting.
    ///
    /// # Errors
    ///
    /// - `SyncError::Supervisor` after shutdown
    pub fn start(&mut self) -> Result<Vec<SyncAction>, SyncError> {
        let actions = self.supervisor.start()?;
        Ok(self.apply_supervisor(actions))
    }

    /// Process a transport or timer event.
    pub fn handle(&mut self, event: SyncEvent) -> Vec<SyncAction> {
        match event {
            SyncEvent::ConnectionChanged(state) => self.handle_connection_changed(state),
            SyncEvent::Inbound(raw) => self.handle_inbound(&raw),
            SyncEvent::RetryElapsed { generation } => {
                let actions = self.supervisor.retry_elapsed(generation);
                self.apply_supervisor(actions)
            },
            SyncEvent::ResendElapsed => self.handle_resend_elapsed(),
            SyncEvent::PublishResult { correlation_id, accepted } => {
                self.handle_publish_result(&correlation_id, accepted)
            },
        }
    }

    /// Optimistic send.
    ///
    /// The pending message is visible immediately. It is published now if
    /// connected, otherwise on the next connect.
    ///
    /// # Errors
    ///
    /// - `SyncError::Engine` for placeholder content
    pub fn send(
        &mut self,
        conversation_id: ConversationId,
        content: Content,
    ) -> Result<(Message, Vec<SyncAction>), SyncError> {
        let correlation_id = CorrelationId::generate(&self.env);
        let now_ms = self.env.wall_clock_ms();
        let message =
            self.engine.send_message(conversation_id.clone(), content, correlation_id, now_ms)?;

        let mut actions = self.track_conversation(&conversation_id);
        let updated = Notification::ConversationUpdated(conversation_id.clone());
        actions.push(SyncAction::Notify(updated));

        if self.supervisor.state() == ConnectionState::Connected {
            let record =
                message.correlation_id.as_ref().and_then(|id| self.engine.record(id)).cloned();
            if let Some(record) = record {
                actions.extend(self.publish(&record));
            }
        }

        Ok((message, actions))
    }

    /// Reset a conversation's unread count.
    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> Vec<SyncAction> {
        let now_ms = self.env.wall_clock_ms();
        if self.unread.mark_read(conversation_id, now_ms) {
            vec![self.unread_changed(conversation_id)]
        } else {
            vec![]
        }
    }

    /// Start viewing a conversation: make it active, mark it read, subscribe.
    pub fn open_conversation(&mut self, conversation_id: &ConversationId) -> Vec<SyncAction> {
        self.unread.set_active(Some(conversation_id.clone()));
        let mut actions = self.mark_read(conversation_id);
        actions.extend(self.track_conversation(conversation_id));
        actions
    }

    /// Stop viewing the active conversation.
    pub fn close_conversation(&mut self) {
        self.unread.set_active(None);
    }

    /// Leave a conversation: stop re-subscribing and drop its messages.
    pub fn leave_conversation(&mut self, conversation_id: &ConversationId) -> Vec<SyncAction> {
        self.subscriptions.remove(conversation_id);
        if self.unread.active() == Some(conversation_id) {
            self.unread.set_active(None);
        }
        if self.engine.evict(conversation_id) {
            vec![SyncAction::Notify(Notification::ConversationUpdated(conversation_id.clone()))]
        } else {
            vec![]
        }
    }

    /// Retry a failed send.
    ///
    /// # Errors
    ///
    /// - `SyncError::Engine` if the message is unknown or has not failed
    pub fn retry_send(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let now_ms = self.env.wall_clock_ms();
        let record = self.engine.retry_failed(correlation_id, now_ms)?;

        let mut actions = vec![SyncAction::Notify(Notification::ConversationUpdated(
            record.conversation_id.clone(),
        ))];
        if self.supervisor.state() == ConnectionState::Connected {
            actions.extend(self.publish(&record));
        }
        Ok(actions)
    }

    /// Manual reconnect.
    ///
    /// # Errors
    ///
    /// - `SyncError::Supervisor` after shutdown
    pub fn reconnect(&mut self) -> Result<Vec<SyncAction>, SyncError> {
        let actions = self.supervisor.manual_retry()?;
        Ok(self.apply_supervisor(actions))
    }

    /// Terminal shutdown. Idempotent.
    pub fn shutdown(&mut self) -> Vec<SyncAction> {
        let actions = self.supervisor.shutdown();
        self.apply_supervisor(actions)
    }

    /// Load older confirmed messages from persistence.
    pub fn seed_history(
        &mut self,
        conversation_id: &ConversationId,
        history: Vec<Message>,
    ) -> Vec<SyncAction> {
        if self.engine.seed_history(conversation_id, history) > 0 {
            vec![SyncAction::Notify(Notification::ConversationUpdated(conversation_id.clone()))]
        } else {
            vec![]
        }
    }

    fn handle_connection_changed(&mut self, state: ConnectionState) -> Vec<SyncAction> {
        let previous = self.supervisor.state();
        let supervisor_actions = self.supervisor.on_state(state);

        let mut actions = Vec::new();
        if previous != state {
            actions.push(SyncAction::Notify(Notification::ConnectionChanged(state)));
        }
        actions.extend(self.apply_supervisor(supervisor_actions));
        actions
    }

    fn handle_inbound(&mut self, raw: &RawEvent) -> Vec<SyncAction> {
        let now_ms = self.env.wall_clock_ms();
        let outcome = self.engine.on_inbound(raw, now_ms);
        trace!(?outcome, topic = %raw.topic, "inbound event");

        match outcome {
            ReconcileOutcome::Inserted { conversation_id, index, from_self } => {
                let mut actions = vec![SyncAction::Notify(Notification::ConversationUpdated(
                    conversation_id.clone(),
                ))];

                let Some(message) = self.engine.messages_of(&conversation_id).get(index) else {
                    return actions;
                };
                let summary = MessageSummary {
                    preview: message.content.preview(PREVIEW_CHARS),
                    sender_id: message.sender_id.clone(),
                    sent_at_ms: message.sent_at_ms,
                };

                let before = self.unread.unread_of(&conversation_id);
                let after = self.unread.on_inbound_message(&conversation_id, from_self, summary);
                if after != before {
                    actions.push(self.unread_changed(&conversation_id));
                }
                actions
            },
            ReconcileOutcome::Replaced { conversation_id, .. }
            | ReconcileOutcome::ReceiptApplied { conversation_id, .. } => {
                vec![SyncAction::Notify(Notification::ConversationUpdated(conversation_id))]
            },
            ReconcileOutcome::Duplicate { .. } | ReconcileOutcome::Ignored => vec![],
        }
    }

    fn handle_publish_result(
        &mut self,
        correlation_id: &CorrelationId,
        accepted: bool,
    ) -> Vec<SyncAction> {
        if accepted {
            match self.engine.publish_succeeded(correlation_id) {
                Ok(attempts) => trace!(%correlation_id, attempts, "publish accepted"),
                Err(EngineError::UnknownPending(_)) => {
                    trace!(%correlation_id, "publish accepted after confirmation");
                },
                Err(err) => warn!(%correlation_id, error = %err, "publish bookkeeping failed"),
            }
            return vec![];
        }

        let conversation_id = self.engine.record(correlation_id).map(|r| r.conversation_id.clone());
        match self.engine.publish_failed(correlation_id, self.config.max_send_attempts) {
            Ok(true) => conversation_id
                .map(|conversation_id| self.send_failed(conversation_id, correlation_id.clone()))
                .unwrap_or_default(),
            Ok(false) if self.supervisor.state() == ConnectionState::Connected => {
                debug!(%correlation_id, "publish rejected, resend scheduled");
                vec![SyncAction::ScheduleResend { delay: self.config.resend_delay }]
            },
            Ok(false) => {
                debug!(%correlation_id, "publish rejected, queued for reconnect");
                vec![]
            },
            Err(err) => {
                trace!(%correlation_id, error = %err, "publish rejected for settled send");
                vec![]
            },
        }
    }

    fn apply_supervisor(&mut self, actions: Vec<SupervisorAction>) -> Vec<SyncAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                SupervisorAction::Connect => {
                    out.push(SyncAction::Connect);
                    out.push(SyncAction::Notify(Notification::ConnectionChanged(
                        ConnectionState::Connecting,
                    )));
                },
                SupervisorAction::ScheduleRetry { delay, generation, attempt } => {
                    debug!(attempt, ?delay, "reconnect scheduled");
                    out.push(SyncAction::ScheduleRetry { delay, generation });
                },
                SupervisorAction::CancelRetry => out.push(SyncAction::CancelRetry),
                SupervisorAction::Resubscribe => {
                    out.extend(self.topics().into_iter().map(SyncAction::Subscribe));
                },
                SupervisorAction::FlushPending => out.extend(self.flush()),
                SupervisorAction::Disconnect => {
                    out.push(SyncAction::Disconnect);
                    out.push(SyncAction::Notify(Notification::ConnectionChanged(
                        ConnectionState::Disconnected,
                    )));
                },
                SupervisorAction::OfflineChanged(offline) => {
                    out.push(SyncAction::Notify(Notification::OfflineChanged(offline)));
                },
            }
        }
        out
    }

    /// Republish sends the transport turned away while connected. Sends
    /// already in flight are left alone; a dropped link flushes them instead.
    fn handle_resend_elapsed(&mut self) -> Vec<SyncAction> {
        if self.supervisor.state() != ConnectionState::Connected {
            trace!("resend timer fired while disconnected");
            return vec![];
        }

        let records: Vec<PendingSendRecord> = self
            .engine
            .pending_records()
            .filter(|record| record.status == SendStatus::Queued)
            .cloned()
            .collect();
        if !records.is_empty() {
            debug!(count = records.len(), "resending rejected sends");
        }
        self.republish(records)
    }

    /// Publish every record in enqueue order.
    fn flush(&mut self) -> Vec<SyncAction> {
        let records: Vec<PendingSendRecord> = self.engine.pending_records().cloned().collect();
        if !records.is_empty() {
            debug!(count = records.len(), "flushing pending sends");
        }
        self.republish(records)
    }

    /// Publish `records` in order. Records whose attempt budget is spent are
    /// marked failed instead.
    fn republish(&mut self, records: Vec<PendingSendRecord>) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        for record in records {
            if record.attempts >= self.config.max_send_attempts {
                if self.engine.mark_failed(&record.correlation_id).is_ok() {
                    actions.extend(self.send_failed(record.conversation_id, record.correlation_id));
                }
                continue;
            }
            actions.extend(self.publish(&record));
        }
        actions
    }

    fn publish(&mut self, record: &PendingSendRecord) -> Vec<SyncAction> {
        let Some(kind) = record.content.kind() else {
            return vec![];
        };

        let envelope = OutboundEnvelope {
            conversation_id: record.conversation_id.to_string(),
            sender_id: self.config.local_user.to_string(),
            kind,
            body: record.content.body().to_owned(),
            timestamp_ms: record.enqueued_at_ms,
            correlation_id: record.correlation_id.to_string(),
        };

        match envelope.encode() {
            Ok(payload) => vec![SyncAction::Publish {
                correlation_id: record.correlation_id.clone(),
                topic: Topic::Conversation(record.conversation_id.clone()),
                payload,
            }],
            Err(err) => {
                warn!(correlation_id = %record.correlation_id, error = %err, "cannot encode send");
                if self.engine.mark_failed(&record.correlation_id).is_ok() {
                    self.send_failed(record.conversation_id.clone(), record.correlation_id.clone())
                } else {
                    vec![]
                }
            },
        }
    }

    fn track_conversation(&mut self, conversation_id: &ConversationId) -> Vec<SyncAction> {
        let added = self.subscriptions.insert(conversation_id.clone());
        if added && self.supervisor.state() == ConnectionState::Connected {
            vec![SyncAction::Subscribe(Topic::Conversation(conversation_id.clone()))]
        } else {
            vec![]
        }
    }

    fn send_failed(
        &self,
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
    ) -> Vec<SyncAction> {
        vec![
            SyncAction::Notify(Notification::SendFailed {
                conversation_id: conversation_id.clone(),
                correlation_id,
            }),
            SyncAction::Notify(Notification::ConversationUpdated(conversation_id)),
        ]
    }

    fn unread_changed(&self, conversation_id: &ConversationId) -> SyncAction {
        SyncAction::Notify(Notification::UnreadChanged {
            conversation_id: conversation_id.clone(),
            unread: self.unread.unread_of(conversation_id),
            total: self.unread.total_unread(),
        })
    }
}

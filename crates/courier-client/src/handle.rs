//! Session facade.
//!
//! [`SyncHandle`] is the one owned entry point a rendering layer holds for a
//! signed-in session. Commands go to the runtime task and resolve once
//! applied; reads take a short lock on the last processed state and never
//! wait on the network.

use std::sync::{Arc, RwLock};

use courier_core::{
    ConnectionState, Content, ConversationId, CorrelationId, Environment, Message,
    MessageSummary, Notification, PendingSendRecord, SyncCore, SyncError,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::{
    config::SessionConfig,
    runtime::{Command, Runtime, read_core},
    transport::{Transport, TransportConnection},
};

/// Errors returned by [`SyncHandle`] commands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session runtime has stopped.
    #[error("session closed")]
    Closed,

    /// The sync core rejected the command.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SyncHandle<E: Environment> {
    commands: mpsc::Sender<Command>,
    core: Arc<RwLock<SyncCore<E>>>,
    notifications: broadcast::Sender<Notification>,
}

impl<E: Environment> SyncHandle<E> {
    /// Start a session and begin connecting.
    ///
    /// Must be called from within a tokio runtime. The session runs until
    /// [`shutdown`](Self::shutdown) or until every handle is dropped.
    pub fn spawn<T: Transport>(env: E, transport: T, config: SessionConfig) -> Self {
        let core = Arc::new(RwLock::new(SyncCore::new(env.clone(), config.sync_config())));
        let connection = TransportConnection::new(
            transport,
            env.clone(),
            config.connect_timeout,
            config.inbound_capacity,
        );
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));

        let runtime = Runtime::new(
            Arc::clone(&core),
            connection,
            config.credentials,
            env,
            commands_rx,
            notifications.clone(),
        );

        info!(user = %config.user_id, "starting session");
        tokio::spawn(runtime.run());

        Self { commands: commands_tx, core, notifications }
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Optimistic send. The returned message is pending.
    pub async fn send(
        &self,
        conversation_id: impl Into<ConversationId>,
        content: Content,
    ) -> Result<Message, SessionError> {
        let conversation_id = conversation_id.into();
        let message = self
            .request(|reply| Command::Send { conversation_id, content, reply })
            .await??;
        Ok(message)
    }

    /// Optimistic text send.
    pub async fn send_text(
        &self,
        conversation_id: impl Into<ConversationId>,
        text: impl Into<String>,
    ) -> Result<Message, SessionError> {
        self.send(conversation_id, Content::text(text)).await
    }

    /// Reset a conversation's unread count.
    pub async fn mark_read(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<(), SessionError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::MarkRead { conversation_id, reply }).await
    }

    /// Start viewing a conversation.
    pub async fn open_conversation(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<(), SessionError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::OpenConversation { conversation_id, reply }).await
    }

    /// Stop viewing the active conversation.
    pub async fn close_conversation(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::CloseConversation { reply }).await
    }

    /// Leave a conversation and drop its messages from memory.
    pub async fn leave_conversation(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<(), SessionError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::LeaveConversation { conversation_id, reply }).await
    }

    /// Retry a failed send.
    pub async fn retry_send(&self, correlation_id: &CorrelationId) -> Result<(), SessionError> {
        let correlation_id = correlation_id.clone();
        self.request(|reply| Command::RetrySend { correlation_id, reply }).await??;
        Ok(())
    }

    /// Manual reconnect. Clears the offline signal.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Reconnect { reply }).await??;
        Ok(())
    }

    /// Load older confirmed messages (oldest first) from persistence.
    pub async fn seed_history(
        &self,
        conversation_id: impl Into<ConversationId>,
        history: Vec<Message>,
    ) -> Result<(), SessionError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::SeedHistory { conversation_id, history, reply }).await
    }

    /// Log out: disconnect and stop the runtime. Idempotent.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            info!("session already stopped");
        }
    }

    /// Messages of a conversation, oldest first.
    pub fn messages_of(&self, conversation_id: &ConversationId) -> Vec<Message> {
        read_core(&self.core).messages_of(conversation_id).to_vec()
    }

    /// Unread count of a conversation.
    pub fn unread_of(&self, conversation_id: &ConversationId) -> u32 {
        read_core(&self.core).unread_of(conversation_id)
    }

    /// Sum of unread counts.
    pub fn total_unread(&self) -> u64 {
        read_core(&self.core).total_unread()
    }

    /// Latest-message summary of a conversation.
    pub fn latest_of(&self, conversation_id: &ConversationId) -> Option<MessageSummary> {
        read_core(&self.core).latest_of(conversation_id).cloned()
    }

    /// Last processed connection state.
    pub fn connection_state(&self) -> ConnectionState {
        read_core(&self.core).connection_state()
    }

    /// Whether automatic retries are exhausted.
    pub fn is_offline(&self) -> bool {
        read_core(&self.core).is_offline()
    }

    /// Pending sends in enqueue order.
    pub fn pending_records(&self) -> Vec<PendingSendRecord> {
        read_core(&self.core).pending_records().cloned().collect()
    }

    /// Push notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Run `f` against the current state under the read lock.
    ///
    /// Keep `f` short; the runtime waits for it.
    pub fn inspect<R>(&self, f: impl FnOnce(&SyncCore<E>) -> R) -> R {
        f(&read_core(&self.core))
    }
}

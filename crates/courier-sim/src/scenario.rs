//! Scripted session run.
//!
//! Sends are spread evenly around the connection drops so some land while
//! connected, some while reconnecting and some mid-flight.

use std::{iter, time::Duration};

use courier_client::{Credentials, SessionConfig, SessionError, SyncHandle};
use courier_core::{
    ConnectionState, ConversationId, InboundEnvelope, MessageEnvelope, Notification, Topic, UserId,
};
use courier_harness::{
    ConnectOutcome, EchoMode, InvariantRegistry, SimEnv, SimServer, SystemSnapshot,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sender of the simulated incoming messages.
const PEER: &str = "bob";

/// Why a run failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The session did not reach the expected state in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A session command failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The settled state broke an invariant.
    #[error("invariants violated: {0}")]
    Invariants(String),
}

/// Run parameters.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub user: String,
    pub conversation: String,
    pub seed: u64,
    pub messages: usize,
    pub drops: usize,
    pub failed_connects: usize,
    pub incoming: usize,
    pub echo_correlation: bool,
    pub settle_timeout: Duration,
}

/// Settled outcome.
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub messages: usize,
    pub unread: u32,
    pub published: usize,
    pub connect_attempts: usize,
}

pub struct Scenario {
    config: ScenarioConfig,
}

impl Scenario {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<Report, ScenarioError> {
        let config = self.config;
        let timeout = config.settle_timeout;

        let server = SimServer::new();
        server.set_echo(if config.echo_correlation {
            EchoMode::Confirm
        } else {
            EchoMode::ConfirmWithoutCorrelation
        });

        let session = SessionConfig::new(config.user.as_str(), Credentials::new("sim-token"));
        let handle = SyncHandle::spawn(SimEnv::with_seed(config.seed), server.transport(), session);
        let observer = tokio::spawn(log_notifications(handle.subscribe()));

        wait_until("initial connect", timeout, || {
            handle.connection_state() == ConnectionState::Connected
        })
        .await?;

        let conversation = ConversationId::new(config.conversation.as_str());
        let user_topic = Topic::User(UserId::new(config.user.as_str()));
        let drop_every = (config.messages / (config.drops + 1)).max(1);
        let mut drops_left = config.drops;
        let mut delivered = 0u32;

        for i in 0..config.messages {
            if i > 0 && i % drop_every == 0 && drops_left > 0 {
                drops_left -= 1;
                server.script(iter::repeat_n(ConnectOutcome::Unreachable, config.failed_connects));
                server.drop_connections();
                info!(remaining = drops_left, "server dropped the connection");
            }

            let message = handle.send_text(conversation.clone(), format!("message {i}")).await?;
            debug!(id = %message.id, "sent");

            if i < config.incoming {
                let envelope = InboundEnvelope::Message(MessageEnvelope {
                    conversation_id: Some(config.conversation.clone()),
                    sender_id: Some(PEER.into()),
                    server_id: Some(format!("{PEER}-{i}")),
                    kind: None,
                    body: Some(format!("reply {i}")),
                    timestamp_ms: None,
                    correlation_id: None,
                });
                if server.deliver(&user_topic, &envelope) == 0 {
                    warn!(index = i, "incoming message reached no session");
                } else {
                    delivered += 1;
                }
            }
        }

        wait_until("sends to settle", timeout, || {
            handle.connection_state() == ConnectionState::Connected
                && handle.pending_records().is_empty()
                && handle.unread_of(&conversation) == delivered
        })
        .await?;

        let snapshot = handle.inspect(SystemSnapshot::from_core);
        InvariantRegistry::standard().check_all(&snapshot).map_err(|violations| {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            ScenarioError::Invariants(messages.join("; "))
        })?;

        let report = Report {
            messages: handle.messages_of(&conversation).len(),
            unread: handle.unread_of(&conversation),
            published: server.published().len(),
            connect_attempts: server.connect_attempts(),
        };

        handle.shutdown().await;
        drop(handle);
        if let Err(err) = observer.await {
            warn!(error = %err, "notification observer failed");
        }

        Ok(report)
    }
}

async fn wait_until(
    what: &'static str,
    timeout: Duration,
    mut ready: impl FnMut() -> bool,
) -> Result<(), ScenarioError> {
    let poll = async {
        while !ready() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.map_err(|_| ScenarioError::Timeout(what))
}

async fn log_notifications(mut notifications: broadcast::Receiver<Notification>) {
    loop {
        match notifications.recv().await {
            Ok(Notification::ConnectionChanged(state)) => info!(?state, "connection"),
            Ok(Notification::OfflineChanged(offline)) => info!(offline, "offline"),
            Ok(Notification::InboundLagged { skipped }) => warn!(skipped, "events lost"),
            Ok(Notification::SendFailed { correlation_id, .. }) => {
                warn!(%correlation_id, "send failed");
            },
            Ok(notification) => debug!(?notification, "notification"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "observer lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

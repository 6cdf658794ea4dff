//! In-process message server for session tests.
//!
//! `SimServer` plays the remote end of a [`SimTransport`]. Tests script how
//! connect attempts end, watch what the client subscribes to and publishes,
//! push events into live sessions and cut connections.
//!
//! When echo is on, every publish is confirmed back on its conversation topic
//! under a server id of the form `srv-<n>`. A republished correlation id gets
//! its original server id again, the way a deduplicating server behaves.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use courier_client::{Link, TransportFrame};
use courier_core::{
    ConversationId, InboundEnvelope, MessageEnvelope, OutboundEnvelope, RawEvent, Topic,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, trace, warn};

use crate::sim_transport::SimTransport;

/// Buffered events per session before the server drops them.
const SESSION_CAPACITY: usize = 256;

/// How a connect attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectOutcome {
    /// Handshake succeeds.
    #[default]
    Accept,
    /// Credentials refused.
    Reject,
    /// Server unreachable.
    Unreachable,
    /// Never completes; the client's connect timeout decides.
    Hang,
}

/// Whether and how publishes are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoMode {
    /// Record publishes only.
    #[default]
    Off,
    /// Confirm with the correlation id echoed.
    Confirm,
    /// Confirm without the correlation id.
    ConfirmWithoutCorrelation,
}

struct Session {
    id: u64,
    events: mpsc::Sender<RawEvent>,
    topics: BTreeSet<Topic>,
}

#[derive(Default)]
pub(crate) struct ServerState {
    script: VecDeque<ConnectOutcome>,
    fallback: ConnectOutcome,
    echo: EchoMode,
    sessions: Vec<Session>,
    next_session: u64,
    next_server_id: u64,
    confirmed: HashMap<String, String>,
    connect_times: Vec<Instant>,
    subscriptions: Vec<Topic>,
    published: Vec<OutboundEnvelope>,
}

impl ServerState {
    /// Outcome for the next connect attempt, recording the attempt.
    pub(crate) fn next_outcome(&mut self) -> ConnectOutcome {
        self.connect_times.push(Instant::now());
        self.script.pop_front().unwrap_or(self.fallback)
    }

    fn has_session(&self, id: u64) -> bool {
        self.sessions.iter().any(|session| session.id == id)
    }

    fn apply(&mut self, session_id: u64, frame: TransportFrame) {
        match frame {
            TransportFrame::Subscribe(topic) => {
                trace!(session = session_id, %topic, "subscribe");
                if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
                    session.topics.insert(topic.clone());
                }
                self.subscriptions.push(topic);
            },
            TransportFrame::Publish { topic, payload } => {
                let envelope = match OutboundEnvelope::decode(&payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(session = session_id, error = %err, "undecodable publish");
                        return;
                    },
                };
                trace!(session = session_id, correlation_id = %envelope.correlation_id, "publish");

                if self.echo != EchoMode::Off {
                    let confirmation = self.confirmation(&envelope);
                    self.deliver(&topic, &InboundEnvelope::Message(confirmation));
                }
                self.published.push(envelope);
            },
        }
    }

    fn confirmation(&mut self, envelope: &OutboundEnvelope) -> MessageEnvelope {
        let server_id = match self.confirmed.get(&envelope.correlation_id) {
            Some(server_id) => server_id.clone(),
            None => {
                self.next_server_id += 1;
                let server_id = format!("srv-{}", self.next_server_id);
                self.confirmed.insert(envelope.correlation_id.clone(), server_id.clone());
                server_id
            },
        };

        let correlation_id =
            (self.echo == EchoMode::Confirm).then(|| envelope.correlation_id.clone());
        MessageEnvelope {
            conversation_id: Some(envelope.conversation_id.clone()),
            sender_id: Some(envelope.sender_id.clone()),
            server_id: Some(server_id),
            kind: Some(envelope.kind.as_tag().to_owned()),
            body: Some(envelope.body.clone()),
            timestamp_ms: Some(envelope.timestamp_ms),
            correlation_id,
        }
    }

    fn deliver(&self, topic: &Topic, envelope: &InboundEnvelope) -> usize {
        match envelope.encode() {
            Ok(payload) => self.deliver_raw(topic, &payload),
            Err(err) => {
                warn!(%topic, error = %err, "cannot encode event");
                0
            },
        }
    }

    fn deliver_raw(&self, topic: &Topic, payload: &Bytes) -> usize {
        let mut delivered = 0;
        for session in self.sessions.iter().filter(|session| session.topics.contains(topic)) {
            let event = RawEvent { topic: topic.clone(), payload: payload.clone() };
            match session.events.try_send(event) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(session = session.id, error = %err, "event dropped"),
            }
        }
        delivered
    }
}

pub(crate) fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register a session and start serving its frames.
pub(crate) fn accept(state: &Arc<Mutex<ServerState>>) -> Link {
    let (to_server, frames) = mpsc::channel(SESSION_CAPACITY);
    let (events, from_server) = mpsc::channel(SESSION_CAPACITY);

    let id = {
        let mut guard = lock(state);
        guard.next_session += 1;
        let id = guard.next_session;
        guard.sessions.push(Session { id, events, topics: BTreeSet::new() });
        id
    };

    debug!(session = id, "session accepted");
    tokio::spawn(serve(Arc::clone(state), id, frames));

    Link { to_server, from_server }
}

async fn serve(
    state: Arc<Mutex<ServerState>>,
    id: u64,
    mut frames: mpsc::Receiver<TransportFrame>,
) {
    while let Some(frame) = frames.recv().await {
        let mut guard = lock(&state);
        if !guard.has_session(id) {
            break;
        }
        guard.apply(id, frame);
    }

    lock(&state).sessions.retain(|session| session.id != id);
    debug!(session = id, "session ended");
}

/// Scriptable server shared by the test and the client under test.
#[derive(Clone, Default)]
pub struct SimServer {
    state: Arc<Mutex<ServerState>>,
}

impl SimServer {
    /// Server that accepts every connect and confirms nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport dialing this server.
    pub fn transport(&self) -> SimTransport {
        SimTransport::new(Arc::clone(&self.state))
    }

    /// Queue outcomes for the next connect attempts, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.state).script.extend(outcomes);
    }

    /// Outcome once the script runs out.
    pub fn set_fallback(&self, outcome: ConnectOutcome) {
        lock(&self.state).fallback = outcome;
    }

    /// Confirm publishes from now on.
    pub fn set_echo(&self, echo: EchoMode) {
        lock(&self.state).echo = echo;
    }

    /// Connect attempts so far.
    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_times.len()
    }

    /// When each connect attempt reached the server.
    pub fn connect_times(&self) -> Vec<Instant> {
        lock(&self.state).connect_times.clone()
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Every subscribe frame received, in arrival order.
    pub fn subscriptions(&self) -> Vec<Topic> {
        lock(&self.state).subscriptions.clone()
    }

    /// Every publish received, in arrival order.
    pub fn published(&self) -> Vec<OutboundEnvelope> {
        lock(&self.state).published.clone()
    }

    /// Server id assigned to a correlation id, once confirmed.
    pub fn server_id_for(&self, correlation_id: &str) -> Option<String> {
        lock(&self.state).confirmed.get(correlation_id).cloned()
    }

    /// Push an event to every session subscribed to `topic`.
    ///
    /// Returns how many sessions received it.
    pub fn deliver(&self, topic: &Topic, envelope: &InboundEnvelope) -> usize {
        lock(&self.state).deliver(topic, envelope)
    }

    /// Push a message on its conversation topic.
    ///
    /// Envelopes without a conversation id reach no one.
    pub fn deliver_message(&self, envelope: MessageEnvelope) -> usize {
        let Some(conversation_id) = envelope.conversation_id.clone() else {
            return 0;
        };
        let topic = Topic::Conversation(ConversationId::new(conversation_id));
        self.deliver(&topic, &InboundEnvelope::Message(envelope))
    }

    /// Push raw bytes to every session subscribed to `topic`.
    pub fn deliver_raw(&self, topic: &Topic, payload: Bytes) -> usize {
        lock(&self.state).deliver_raw(topic, &payload)
    }

    /// Close every live session from the server side.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut lock(&self.state).sessions);
        debug!(count = dropped.len(), "dropping sessions");
    }
}

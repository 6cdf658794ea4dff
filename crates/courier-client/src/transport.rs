//! Transport connection.
//!
//! [`TransportConnection`] wraps a [`Transport`] collaborator and turns its
//! fallible, async connect into state transitions:
//!
//! - `connect` reports `Connecting` immediately and returns; a spawned task
//!   reports `Connected` or `Failed` later
//! - `publish` and `subscribe` never suspend and never error; `false` means
//!   the caller keeps the work queued
//! - inbound events are multicast to every live subscriber, without replay
//!
//! Each connect attempt has a generation. Results from an attempt that was
//! superseded (by `disconnect` or a newer `connect`) are dropped, so two
//! live links can never race.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use courier_core::{ConnectionState, Environment, RawEvent, Topic};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Credentials;

/// Transport errors.
///
/// These never cross the connection boundary; they become `Failed`
/// transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connect attempt did not complete in time.
    #[error("connect timed out")]
    Timeout,

    /// Server refused the handshake (e.g. expired credentials).
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connection closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying may succeed without user intervention.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// Request delivery of a topic.
    Subscribe(Topic),
    /// Publish an encoded envelope to a topic.
    Publish {
        /// Destination.
        topic: Topic,
        /// Encoded outbound envelope.
        payload: Bytes,
    },
}

/// An established link: channels to and from the server.
///
/// Dropping `to_server` or closing `from_server` ends the link.
#[derive(Debug)]
pub struct Link {
    /// Frames to the server.
    pub to_server: mpsc::Sender<TransportFrame>,
    /// Events from the server.
    pub from_server: mpsc::Receiver<RawEvent>,
}

/// Authenticated bidirectional connection collaborator.
pub trait Transport: Send + Sync + 'static {
    /// Open a link, performing the authentication handshake.
    ///
    /// # Errors
    ///
    /// - `TransportError::Rejected` if the server refuses the credentials
    /// - `TransportError::Connection` if the server is unreachable
    fn open(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

struct Shared {
    generation: u64,
    link: Option<mpsc::Sender<TransportFrame>>,
    cancel: CancellationToken,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Singleton connection owned by the session runtime.
pub struct TransportConnection<T: Transport, E: Environment> {
    transport: Arc<T>,
    env: E,
    connect_timeout: Duration,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    inbound_tx: broadcast::Sender<RawEvent>,
    shared: Arc<Mutex<Shared>>,
}

impl<T: Transport, E: Environment> TransportConnection<T, E> {
    /// Create a disconnected connection.
    pub fn new(transport: T, env: E, connect_timeout: Duration, inbound_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(inbound_capacity.max(1));
        Self {
            transport: Arc::new(transport),
            env,
            connect_timeout,
            state_tx: Arc::new(state_tx),
            inbound_tx,
            shared: Arc::new(Mutex::new(Shared {
                generation: 0,
                link: None,
                cancel: CancellationToken::new(),
            })),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Stream of state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Stream of inbound events from now on.
    pub fn inbound_events(&self) -> broadcast::Receiver<RawEvent> {
        self.inbound_tx.subscribe()
    }

    /// Start a connect attempt, superseding any previous one.
    ///
    /// Reports `Connecting` before returning. Must be called from within a
    /// tokio runtime.
    pub fn connect(&self, credentials: &Credentials) -> watch::Receiver<ConnectionState> {
        let (generation, cancel) = {
            let mut shared = lock(&self.shared);
            shared.cancel.cancel();
            shared.link = None;
            shared.generation += 1;
            shared.cancel = CancellationToken::new();
            self.state_tx.send_replace(ConnectionState::Connecting);
            (shared.generation, shared.cancel.clone())
        };

        debug!(generation, "connecting");

        let attempt = ConnectAttempt {
            transport: Arc::clone(&self.transport),
            env: self.env.clone(),
            timeout: self.connect_timeout,
            credentials: credentials.clone(),
            state_tx: Arc::clone(&self.state_tx),
            inbound_tx: self.inbound_tx.clone(),
            shared: Arc::clone(&self.shared),
            generation,
            cancel,
        };
        tokio::spawn(attempt.run());

        self.state_tx.subscribe()
    }

    /// Publish an encoded envelope. `false` if not connected or the outbound
    /// queue is full.
    pub fn publish(&self, topic: Topic, payload: Bytes) -> bool {
        self.try_send(TransportFrame::Publish { topic, payload })
    }

    /// Subscribe to a topic. `false` if not connected.
    pub fn subscribe(&self, topic: Topic) -> bool {
        self.try_send(TransportFrame::Subscribe(topic))
    }

    /// Tear down the link and cancel any attempt. Idempotent.
    pub fn disconnect(&self) {
        let mut shared = lock(&self.shared);
        shared.cancel.cancel();
        shared.link = None;
        shared.generation += 1;

        let changed = self.state_tx.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
        if changed {
            info!("disconnected");
        }
    }

    fn try_send(&self, frame: TransportFrame) -> bool {
        let shared = lock(&self.shared);
        let Some(link) = shared.link.as_ref() else {
            return false;
        };

        match link.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "outbound frame rejected");
                false
            },
        }
    }
}

impl<T: Transport, E: Environment> Drop for TransportConnection<T, E> {
    fn drop(&mut self) {
        lock(&self.shared).cancel.cancel();
    }
}

/// One connect attempt plus, on success, the inbound pump of its link.
struct ConnectAttempt<T: Transport, E: Environment> {
    transport: Arc<T>,
    env: E,
    timeout: Duration,
    credentials: Credentials,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    inbound_tx: broadcast::Sender<RawEvent>,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    cancel: CancellationToken,
}

impl<T: Transport, E: Environment> ConnectAttempt<T, E> {
    async fn run(self) {
        let opened = tokio::select! {
            () = self.cancel.cancelled() => return,
            () = self.env.sleep(self.timeout) => Err(TransportError::Timeout),
            result = self.transport.open(&self.credentials) => result,
        };

        let mut from_server = match opened {
            Ok(Link { to_server, from_server }) => {
                let mut shared = lock(&self.shared);
                if shared.generation != self.generation || self.cancel.is_cancelled() {
                    debug!(generation = self.generation, "discarding superseded link");
                    return;
                }
                shared.link = Some(to_server);
                self.state_tx.send_replace(ConnectionState::Connected);
                from_server
            },
            Err(err) => {
                if err.is_transient() {
                    debug!(generation = self.generation, error = %err, "connect failed");
                } else {
                    warn!(generation = self.generation, error = %err, "connect rejected");
                }
                self.finish(ConnectionState::Failed);
                return;
            },
        };

        info!(generation = self.generation, "connected");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                event = from_server.recv() => match event {
                    Some(event) => {
                        if self.inbound_tx.send(event).is_err() {
                            trace!("inbound event with no subscribers");
                        }
                    },
                    None => break,
                },
            }
        }

        info!(generation = self.generation, "link closed by server");
        self.finish(ConnectionState::Disconnected);
    }

    /// Report the end of this attempt unless it was superseded.
    fn finish(&self, state: ConnectionState) {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation || self.cancel.is_cancelled() {
            return;
        }
        shared.link = None;
        self.state_tx.send_replace(state);
    }
}

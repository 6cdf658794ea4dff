//! Reconnection supervisor.
//!
//! Observes connection-state transitions and decides when to reconnect. Uses
//! the action pattern: inputs are state changes, timer expiries and user
//! requests; outputs are [`SupervisorAction`]s the driver executes. The
//! supervisor never touches the transport or a clock itself.
//!
//! # State Machine
//!
//! ```text
//!                 start / manual retry
//! ┌──────────────┐ ───────────────────> ┌────────────┐   ok    ┌───────────┐
//! │ Disconnected │                      │ Connecting │───────> │ Connected │
//! └──────────────┘ <─┐                  └────────────┘         └───────────┘
//!        ^           │ shutdown               │ error                │ drop
//!        │           │                        v                      │
//!        │           │                   ┌────────┐                  │
//!        │           └───────────────────│ Failed │ <────────────────┘
//!        │                               └────────┘
//!        │                                 │ retry timer (attempt <= N)
//!        └─────── offline (attempt > N) ───┘
//! ```
//!
//! Every scheduled retry carries a generation. Cancelling (connect success,
//! manual retry, shutdown) bumps the generation so a timer that fires late is
//! ignored and can never start a second concurrent attempt.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{backoff::BackoffPolicy, error::SupervisorError};

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// Attempt in progress.
    Connecting,
    /// Authenticated and subscribed.
    Connected,
    /// Last attempt or live connection failed.
    Failed,
}

/// Actions returned by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Start a connection attempt now.
    Connect,
    /// Arm a retry timer. Report expiry via
    /// [`ReconnectSupervisor::retry_elapsed`] with the same generation.
    ScheduleRetry {
        /// Time to wait.
        delay: Duration,
        /// Generation identifying this timer.
        generation: u64,
        /// Retry number (1-based).
        attempt: u32,
    },
    /// Disarm the outstanding retry timer.
    CancelRetry,
    /// Re-subscribe to every active topic.
    Resubscribe,
    /// Publish queued pending sends in enqueue order.
    FlushPending,
    /// Tear the connection down.
    Disconnect,
    /// Offline signal changed.
    OfflineChanged(bool),
}

/// Reconnection supervisor state machine.
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    policy: BackoffPolicy,
    state: ConnectionState,
    /// Consecutive failures since the last successful connect.
    attempt: u32,
    offline: bool,
    shut_down: bool,
    retry_generation: u64,
    retry_pending: bool,
}

impl ReconnectSupervisor {
    /// Create a supervisor in [`ConnectionState::Disconnected`].
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            offline: false,
            shut_down: false,
            retry_generation: 0,
            retry_pending: false,
        }
    }

    /// Last observed connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful connect.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether automatic retries are exhausted.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Whether a retry timer is armed.
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Backoff policy in use.
    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Begin connecting.
    ///
    /// No-op if an attempt is already in progress or the connection is up.
    ///
    /// # Errors
    ///
    /// - `SupervisorError::InvalidState` after shutdown
    pub fn start(&mut self) -> Result<Vec<SupervisorAction>, SupervisorError> {
        if self.shut_down {
            return Err(SupervisorError::InvalidState { state: self.state, operation: "start" });
        }

        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Ok(vec![]);
        }

        self.state = ConnectionState::Connecting;
        Ok(vec![SupervisorAction::Connect])
    }

    /// Feed a connection-state transition reported by the transport.
    pub fn on_state(&mut self, new: ConnectionState) -> Vec<SupervisorAction> {
        let previous = self.state;
        self.state = new;

        if self.shut_down {
            return vec![];
        }

        if previous == new && new != ConnectionState::Failed {
            return vec![];
        }

        match new {
            ConnectionState::Connecting => vec![],
            ConnectionState::Connected => self.on_connected(),
            ConnectionState::Failed => self.on_failure(),
            ConnectionState::Disconnected => {
                // A close after a failure was already counted.
                if matches!(previous, ConnectionState::Connected | ConnectionState::Connecting) {
                    self.on_failure()
                } else {
                    vec![]
                }
            },
        }
    }

    /// Report that the retry timer of `generation` fired.
    ///
    /// Stale generations are ignored.
    pub fn retry_elapsed(&mut self, generation: u64) -> Vec<SupervisorAction> {
        if self.shut_down || !self.retry_pending || generation != self.retry_generation {
            debug!(generation, current = self.retry_generation, "ignoring stale retry timer");
            return vec![];
        }

        self.retry_pending = false;

        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return vec![];
        }

        debug!(attempt = self.attempt, "retry timer elapsed, reconnecting");
        self.state = ConnectionState::Connecting;
        vec![SupervisorAction::Connect]
    }

    /// User-initiated retry.
    ///
    /// Clears the offline signal, resets the attempt counter and connects
    /// immediately, cancelling any armed timer.
    ///
    /// # Errors
    ///
    /// - `SupervisorError::InvalidState` after shutdown
    pub fn manual_retry(&mut self) -> Result<Vec<SupervisorAction>, SupervisorError> {
        if self.shut_down {
            return Err(SupervisorError::InvalidState {
                state: self.state,
                operation: "manual_retry",
            });
        }

        let mut actions = Vec::new();
        self.cancel_retry(&mut actions);
        self.attempt = 0;
        if self.offline {
            self.offline = false;
            actions.push(SupervisorAction::OfflineChanged(false));
        }

        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            info!("manual reconnect");
            self.state = ConnectionState::Connecting;
            actions.push(SupervisorAction::Connect);
        }

        Ok(actions)
    }

    /// Terminal shutdown (logout). Idempotent.
    pub fn shutdown(&mut self) -> Vec<SupervisorAction> {
        if self.shut_down {
            return vec![];
        }

        self.shut_down = true;
        let mut actions = Vec::new();
        self.cancel_retry(&mut actions);
        self.state = ConnectionState::Disconnected;
        actions.push(SupervisorAction::Disconnect);
        actions
    }

    fn on_connected(&mut self) -> Vec<SupervisorAction> {
        info!(after_failures = self.attempt, "connected");

        let mut actions = Vec::new();
        self.cancel_retry(&mut actions);
        self.attempt = 0;
        if self.offline {
            self.offline = false;
            actions.push(SupervisorAction::OfflineChanged(false));
        }

        actions.push(SupervisorAction::Resubscribe);
        actions.push(SupervisorAction::FlushPending);
        actions
    }

    fn on_failure(&mut self) -> Vec<SupervisorAction> {
        if self.offline || self.retry_pending {
            return vec![];
        }

        self.attempt = self.attempt.saturating_add(1);

        if !self.policy.allows(self.attempt) {
            warn!(failures = self.attempt, "retries exhausted, going offline");
            self.offline = true;
            return vec![SupervisorAction::OfflineChanged(true)];
        }

        self.retry_generation += 1;
        self.retry_pending = true;
        let delay = self.policy.delay_for_attempt(self.attempt);
        debug!(attempt = self.attempt, ?delay, "scheduling reconnect");

        vec![SupervisorAction::ScheduleRetry {
            delay,
            generation: self.retry_generation,
            attempt: self.attempt,
        }]
    }

    fn cancel_retry(&mut self, actions: &mut Vec<SupervisorAction>) {
        if self.retry_pending {
            self.retry_pending = false;
            self.retry_generation += 1;
            actions.push(SupervisorAction::CancelRetry);
        }
    }
}

//! Session configuration.

use std::{fmt, time::Duration};

use courier_core::{
    BackoffPolicy, SyncConfig, UserId,
    sync::{DEFAULT_MAX_SEND_ATTEMPTS, DEFAULT_RESEND_DELAY},
};

/// Upper bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the command channel from handles to the runtime.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Capacity of the notification broadcast.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Capacity of the inbound event broadcast.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Opaque bearer token presented when connecting.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    /// Wrap a bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token.
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// Configuration for one signed-in session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The signed-in user.
    pub user_id: UserId,
    /// Bearer token for the transport.
    pub credentials: Credentials,
    /// Reconnect schedule.
    pub backoff: BackoffPolicy,
    /// Publish attempts per send before it is marked failed.
    pub max_send_attempts: u32,
    /// Wait before republishing sends rejected on a live connection.
    pub resend_delay: Duration,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Command channel capacity.
    pub command_capacity: usize,
    /// Notification broadcast capacity. Slow observers skip ahead.
    pub notification_capacity: usize,
    /// Inbound event broadcast capacity.
    pub inbound_capacity: usize,
}

impl SessionConfig {
    /// Defaults for `user_id`.
    pub fn new(user_id: impl Into<UserId>, credentials: Credentials) -> Self {
        Self {
            user_id: user_id.into(),
            credentials,
            backoff: BackoffPolicy::default(),
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            resend_delay: DEFAULT_RESEND_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    /// Configuration for the sync core.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            local_user: self.user_id.clone(),
            backoff: self.backoff,
            max_send_attempts: self.max_send_attempts,
            resend_delay: self.resend_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_redacted() {
        let credentials = Credentials::new("secret-token");
        assert_eq!(format!("{credentials:?}"), "Credentials(<redacted>)");
        assert_eq!(credentials.token(), "secret-token");

        let config = SessionConfig::new("alice", credentials);
        assert!(!format!("{config:?}").contains("secret-token"));
    }

    #[test]
    fn sync_config_carries_session_settings() {
        let mut config = SessionConfig::new("alice", Credentials::new("t"));
        config.max_send_attempts = 7;
        config.resend_delay = Duration::from_millis(250);

        let sync = config.sync_config();
        assert_eq!(sync.local_user, UserId::new("alice"));
        assert_eq!(sync.max_send_attempts, 7);
        assert_eq!(sync.resend_delay, Duration::from_millis(250));
        assert_eq!(sync.backoff, BackoffPolicy::default());
    }
}

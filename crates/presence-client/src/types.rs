//! Public types for the presence session.

use std::time::Duration;

use parley_protocol::constants::{WS_CLOSE_AUTH_FAILED, WS_CLOSE_SUPERSEDED};
use parley_protocol::presence::{OnlineSet, UserId};

/// Transport state of a [`PresenceSession`](crate::PresenceSession).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// WebSocket handshake in progress.
    Connecting,
    /// Transport open, presence pushes flowing.
    Connected,
    /// Connection lost, attempting to reconnect.
    Reconnecting { attempt: u32 },
    /// No transport.
    Disconnected,
}

/// Identity presented to the server when opening the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: UserId,
    /// Session credential from the HTTP login, if the server checks one.
    pub token: Option<String>,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Close frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerClose {
    pub code: u16,
    pub reason: String,
}

impl ServerClose {
    /// The server refused the identity claim or its credential.
    pub fn is_auth_failure(&self) -> bool {
        self.code == WS_CLOSE_AUTH_FAILED
    }

    /// A newer connection took over this identity.
    pub fn is_superseded(&self) -> bool {
        self.code == WS_CLOSE_SUPERSEDED
    }

    /// Reconnecting would only repeat the same outcome (or fight the
    /// connection that replaced us).
    pub fn suppresses_reconnect(&self) -> bool {
        self.is_auth_failure() || self.is_superseded()
    }
}

/// Events emitted by the presence session.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport state changed.
    StateChanged(ConnectionState),
    /// A presence push replaced the cached online set.
    PresenceUpdated(OnlineSet),
    /// Reconnection is in progress.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
    /// The server closed the transport for good (auth failure or
    /// supersession). No reconnect follows.
    ClosedByServer(ServerClose),
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Give up after this many failed attempts (`None` = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter so clients dropped together do not return together.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }

    /// Returns `true` once `attempt` exceeds the configured limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

//! Connection lifecycle: phases, identity claims and the events the
//! connection tasks emit towards the presence hub.
//!
//! ```text
//! Pending ──(upgrade, claim read)──> Authenticating
//! Authenticating ──(accepted)──> Active ──(transport closed)──> Closed
//! Authenticating ──(rejected / timed out)──> Rejected
//! ```

use std::fmt;

use parley_protocol::constants::{QUERY_TOKEN, QUERY_USER_ID};
use parley_protocol::presence::UserId;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Phase of a single connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Pending,
    Authenticating,
    Active,
    /// Terminal: authentication failed, nothing was registered.
    Rejected,
    /// Terminal: transport closed after being active.
    Closed,
}

impl ConnectionPhase {
    /// Returns `true` if `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Pending, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Rejected)
                | (Active, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionPhase::Rejected | ConnectionPhase::Closed)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Pending => "pending",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Rejected => "rejected",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Errors from driving the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition {from} -> {to} for connection {connection}")]
    IllegalTransition {
        connection: ConnectionId,
        from: ConnectionPhase,
        to: ConnectionPhase,
    },
}

/// Tracks the phase of one connection attempt.
#[derive(Debug)]
pub struct Lifecycle {
    connection: ConnectionId,
    phase: ConnectionPhase,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            connection: ConnectionId::new(),
            phase: ConnectionPhase::Pending,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Moves to `next`, refusing transitions the state machine does not allow.
    pub fn advance(&mut self, next: ConnectionPhase) -> Result<(), LifecycleError> {
        if !self.phase.can_advance_to(next) {
            return Err(LifecycleError::IllegalTransition {
                connection: self.connection,
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!(conn = %self.connection, from = %self.phase, to = %next, "lifecycle");
        self.phase = next;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity claim and optional credential presented when opening the
/// transport (`?userId=...&token=...`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaim {
    pub user_id: Option<UserId>,
    pub token: Option<String>,
}

impl IdentityClaim {
    /// Extracts the claim from the upgrade request's query string.
    ///
    /// Empty values count as absent.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut claim = Self::default();
        let Some(query) = query else {
            return claim;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                QUERY_USER_ID => claim.user_id = Some(UserId::from(value.into_owned())),
                QUERY_TOKEN => claim.token = Some(value.into_owned()),
                _ => {}
            }
        }
        claim
    }
}

/// Events emitted by connection tasks and consumed by the presence hub.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// The connection became active. `identity` is `None` for connections
    /// opened without an identity claim.
    Opened {
        handle: ConnectionHandle,
        identity: Option<UserId>,
    },
    /// The transport closed, by the peer, by an error or by the server.
    Closed {
        connection: ConnectionId,
        identity: Option<UserId>,
    },
}

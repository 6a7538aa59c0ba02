//! Presence server for Parley.
//!
//! Accepts WebSocket connections carrying an identity claim, keeps a
//! registry of which user holds which live connection, and pushes the
//! full online set to every connected peer whenever the registry changes.

pub mod auth;
mod broadcaster;
mod connection;
mod hub;
pub mod lifecycle;
pub mod registry;
mod server;

pub use auth::{AuthError, AuthFuture, Authenticator, SessionTable, TrustClaim};
pub use broadcaster::{BroadcastReport, Broadcaster};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionMeta, SendError, Sender};
pub use hub::PresenceHub;
pub use lifecycle::{ConnectionPhase, IdentityClaim, LifecycleError, LifecycleEvent};
pub use registry::{InMemoryRegistry, PresenceRegistry, RegistryFuture};
pub use server::{DEFAULT_AUTH_TIMEOUT, DEFAULT_PORT, PresenceServer, ServerConfig};

/// Per-connection send buffer capacity.
///
/// A peer whose queue is full misses that presence push and picks up the
/// next one, since every push carries the full set.
pub const SEND_BUFFER_SIZE: usize = 64;

/// Capacity of the lifecycle event channel feeding the hub task.
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Errors produced by the presence server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server already running")]
    AlreadyRunning,

    #[error("WebSocket upgrade timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

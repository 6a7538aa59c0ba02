use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// peer is considered dead and the connection is torn down, which the
/// presence layer treats exactly like a clean disconnect.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings (must be well below [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum message size in bytes (1 MB).
///
/// Presence pushes carry the whole online set, so this bounds the
/// deployment size rather than any single user action.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Query parameter carrying the identity claim on connect.
pub const QUERY_USER_ID: &str = "userId";

/// Query parameter carrying the optional session credential on connect.
pub const QUERY_TOKEN: &str = "token";

/// Close code: the credential presented on connect was rejected.
pub const WS_CLOSE_AUTH_FAILED: u16 = 4001;

/// Close code: a newer connection registered the same identity.
pub const WS_CLOSE_SUPERSEDED: u16 = 4002;

/// Close code: the server is going away (standard 1001).
pub const WS_CLOSE_GOING_AWAY: u16 = 1001;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Push events from server to client
    /// Full online set, sent after every registry mutation.
    #[serde(rename = "getOnlineUsers")]
    GetOnlineUsers,

    // Keepalive
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Error code for client requests the server does not serve.
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

//! Presence client for Parley.
//!
//! Opens the presence WebSocket for a logged-in user, keeps a local copy of
//! the online set that the server pushes, and reconnects with backoff when
//! the transport drops unexpectedly.

pub mod cache;
mod pumps;
pub mod session;
pub mod types;
pub mod ws_client;

pub use cache::PresenceCache;
pub use session::PresenceSession;
pub use types::{ClientEvent, ClientIdentity, ConnectionState, ReconnectConfig, ServerClose};
pub use ws_client::{WsClient, WsEvent, presence_url};

use tokio_tungstenite::tungstenite;

/// Errors from the presence client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "request timed out");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");

        let err = ClientError::Server {
            code: 501,
            message: "unknown message type".into(),
        };
        assert!(err.to_string().contains("501"));

        let err = ClientError::from(url::Url::parse("not a url").unwrap_err());
        assert!(err.to_string().starts_with("invalid server URL"));
    }
}

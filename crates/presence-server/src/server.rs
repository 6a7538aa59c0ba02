//! Presence WebSocket server.
//!
//! Listens on a TCP port, upgrades every request to WebSocket, reads the
//! identity claim from the upgrade query string and hands authenticated
//! connections to the presence hub.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use parley_protocol::constants::{WS_CLOSE_AUTH_FAILED, WS_MAX_MESSAGE_SIZE};
use parley_protocol::presence::OnlineSet;

use crate::auth::{AuthError, Authenticator};
use crate::connection::{self, ConnectionMeta};
use crate::hub::PresenceHub;
use crate::lifecycle::{ConnectionPhase, IdentityClaim, Lifecycle, LifecycleEvent};
use crate::registry::PresenceRegistry;
use crate::{EVENT_BUFFER_SIZE, ServerError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default upper bound on the WebSocket upgrade and on the connect-time
/// authentication step, each.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long [`PresenceServer::run`] waits for connections to send their
/// close frames after shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// An upgrade or authentication step that takes longer than this drops
    /// the connection.
    pub auth_timeout: Duration,
    /// Close the previous connection when a user reconnects.
    pub close_superseded: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            close_superseded: true,
        }
    }
}

/// The presence server.
pub struct PresenceServer<A: Authenticator, R: PresenceRegistry> {
    config: ServerConfig,
    authenticator: Arc<A>,
    registry: Arc<R>,
    events_tx: mpsc::Sender<LifecycleEvent>,
    /// Hub and its event receiver, taken by the first call to [`run`](Self::run).
    hub: Mutex<Option<(PresenceHub<R>, mpsc::Receiver<LifecycleEvent>)>>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    /// Hub, handshake and connection tasks, drained on shutdown.
    tasks: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<A: Authenticator, R: PresenceRegistry> PresenceServer<A, R> {
    /// Creates a new server around the given authenticator and registry.
    pub fn new(config: ServerConfig, authenticator: A, registry: Arc<R>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let hub = PresenceHub::new(Arc::clone(&registry), config.close_superseded);
        let active = hub.active_counter();

        Arc::new(Self {
            config,
            authenticator: Arc::new(authenticator),
            registry,
            events_tx,
            hub: Mutex::new(Some((hub, events_rx))),
            active,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Users currently registered as online.
    pub async fn online_users(&self) -> OnlineSet {
        self.registry.snapshot().await
    }

    /// Active connections, including ones without an identity claim.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    ///
    /// Binds to the configured address, starts the presence hub and accepts
    /// WebSocket connections. After [`shutdown`](Self::shutdown) it returns
    /// once every connection has sent its close frame, or after a short
    /// grace period.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let (hub, events_rx) = self
            .hub
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("presence server listening on {local_addr}");

        self.tasks.spawn(hub.run(events_rx, self.cancel.clone()));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            self.tasks.spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection ended during handshake: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tasks.len(),
                "connections still open after shutdown grace period"
            );
        }
        Ok(())
    }

    /// Upgrades one TCP connection, authenticates it and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut lifecycle = Lifecycle::new();

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let mut query: Option<String> = None;
        let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        };
        let mut ws_stream = tokio::time::timeout(
            self.config.auth_timeout,
            accept_hdr_async_with_config(stream, capture_query, Some(ws_config)),
        )
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;

        let claim = IdentityClaim::from_query(query.as_deref());
        lifecycle.advance(ConnectionPhase::Authenticating)?;
        tracing::debug!(
            %peer_addr,
            conn = %lifecycle.connection_id(),
            user = claim.user_id.as_ref().map(|u| u.as_str()).unwrap_or("-"),
            "WebSocket connection established"
        );

        let verdict = tokio::time::timeout(
            self.config.auth_timeout,
            self.authenticator.authenticate(&claim),
        )
        .await
        .unwrap_or(Err(AuthError::Timeout));

        match verdict {
            Ok(identity) => {
                lifecycle.advance(ConnectionPhase::Active)?;
                connection::spawn_connection(
                    ws_stream,
                    ConnectionMeta::new(peer_addr.to_string()),
                    lifecycle,
                    identity,
                    self.events_tx.clone(),
                    &self.cancel,
                    &self.tasks,
                );
                Ok(())
            }
            Err(e) => {
                lifecycle.advance(ConnectionPhase::Rejected)?;
                tracing::warn!(%peer_addr, "rejecting connection: {e}");
                let frame = CloseFrame {
                    code: CloseCode::from(WS_CLOSE_AUTH_FAILED),
                    reason: e.to_string().into(),
                };
                let _ = ws_stream.close(Some(frame)).await;
                Ok(())
            }
        }
    }
}

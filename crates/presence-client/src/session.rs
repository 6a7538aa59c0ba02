//! Presence session: one logged-in user's transport, cache and reconnects.
//!
//! The session owns at most one [`WsClient`]. Each transport gets a
//! generation number; events from a transport that has since been replaced
//! are ignored, so a late close from an old socket never tears down or
//! reconnects over the current one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_protocol::presence::OnlineSet;

use crate::ClientError;
use crate::cache::PresenceCache;
use crate::types::{ClientEvent, ClientIdentity, ConnectionState, ReconnectConfig, ServerClose};
use crate::ws_client::{WsClient, WsEvent};

/// Capacity of the session event channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// State shared between the session, its transport driver and the
/// reconnect loop.
#[derive(Clone)]
struct SessionContext {
    base_url: Arc<str>,
    reconnect_config: ReconnectConfig,
    cache: Arc<PresenceCache>,
    client: Arc<Mutex<Option<Arc<WsClient>>>>,
    identity: Arc<Mutex<Option<ClientIdentity>>>,
    state: Arc<RwLock<ConnectionState>>,
    events_tx: mpsc::Sender<ClientEvent>,
    /// Bumped every time the transport slot changes.
    generation: Arc<AtomicU64>,
    /// Set when the user logs out; suppresses reconnection.
    manual_disconnect: Arc<AtomicBool>,
    reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
}

/// A user's presence session.
pub struct PresenceSession {
    ctx: SessionContext,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

impl PresenceSession {
    /// Creates a disconnected session for the server at `base_url`
    /// (e.g. `ws://chat.example:5000`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_reconnect_config(base_url, ReconnectConfig::default())
    }

    pub fn with_reconnect_config(base_url: impl Into<String>, config: ReconnectConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let base_url: String = base_url.into();

        Self {
            ctx: SessionContext {
                base_url: Arc::from(base_url),
                reconnect_config: config,
                cache: Arc::new(PresenceCache::new()),
                client: Arc::new(Mutex::new(None)),
                identity: Arc::new(Mutex::new(None)),
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                events_tx,
                generation: Arc::new(AtomicU64::new(0)),
                manual_disconnect: Arc::new(AtomicBool::new(false)),
                reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
            },
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn state(&self) -> ConnectionState {
        self.ctx.state.read().await.clone()
    }

    /// Users the server last reported as online.
    pub fn online_users(&self) -> OnlineSet {
        self.ctx.cache.online_users()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.ctx.cache.is_online(user_id)
    }

    /// Watches the cached online set.
    pub fn subscribe(&self) -> watch::Receiver<OnlineSet> {
        self.ctx.cache.subscribe()
    }

    /// Opens the presence transport for `identity`.
    ///
    /// A no-op when a healthy transport for the same identity is already
    /// open. Otherwise any previous transport and pending reconnect are
    /// dropped first.
    pub async fn connect(&self, identity: ClientIdentity) -> Result<(), ClientError> {
        {
            let client = self.ctx.client.lock().await;
            let healthy = client.as_ref().is_some_and(|c| c.is_connected());
            if healthy && self.ctx.identity.lock().await.as_ref() == Some(&identity) {
                debug!(user = %identity.user_id, "presence transport already open");
                return Ok(());
            }
        }

        cancel_reconnect(&self.ctx.reconnect_cancel);
        self.ctx.manual_disconnect.store(false, Ordering::SeqCst);
        *self.ctx.identity.lock().await = Some(identity.clone());
        self.ctx.clear_transport().await;

        self.ctx.set_state(ConnectionState::Connecting).await;
        info!(user = %identity.user_id, url = %self.ctx.base_url, "opening presence transport");

        match open_transport(&self.ctx, &identity, None).await {
            Ok(true) => Ok(()),
            // Logged out while the handshake was in flight.
            Ok(false) => Err(ClientError::Closed),
            Err(e) => {
                warn!(user = %identity.user_id, "presence connect failed: {e}");
                self.ctx.set_state(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Logs out: closes the transport, cancels any reconnect and empties
    /// the online list.
    pub async fn disconnect(&self) {
        self.ctx.manual_disconnect.store(true, Ordering::SeqCst);
        cancel_reconnect(&self.ctx.reconnect_cancel);
        self.ctx.clear_transport().await;
        *self.ctx.identity.lock().await = None;
        self.ctx.cache.clear();
        self.ctx.set_state(ConnectionState::Disconnected).await;
        info!("presence session closed");
    }

    /// Application-level round trip over the current transport.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let client = self.ctx.client.lock().await.clone();
        match client {
            Some(client) => client.ping().await,
            None => Err(ClientError::Closed),
        }
    }
}

impl SessionContext {
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            *state = next.clone();
            drop(state);
            self.emit(ClientEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("session event dropped: {e}");
        }
    }

    /// Empties the transport slot, closing whatever was there.
    async fn clear_transport(&self) {
        let mut slot = self.client.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = slot.take() {
            old.close().await;
        }
    }

    /// Handles the end of the transport with the given generation.
    async fn transport_closed(&self, generation: u64, close: Option<ServerClose>) {
        {
            let mut slot = self.client.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            slot.take();
        }

        self.set_state(ConnectionState::Disconnected).await;

        if self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }

        if let Some(close) = close.filter(ServerClose::suppresses_reconnect) {
            warn!(code = close.code, reason = %close.reason, "server ended presence session");
            self.emit(ClientEvent::ClosedByServer(close));
            return;
        }

        let cancel = CancellationToken::new();
        cancel_reconnect(&self.reconnect_cancel);
        if let Ok(mut guard) = self.reconnect_cancel.lock() {
            *guard = Some(cancel.clone());
        }
        tokio::spawn(reconnect_loop(self.clone(), cancel));
    }
}

/// Cancels the active reconnect loop, if any.
fn cancel_reconnect(reconnect_cancel: &std::sync::Mutex<Option<CancellationToken>>) {
    if let Ok(mut guard) = reconnect_cancel.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Connects, installs the client and starts its driver.
///
/// Returns `Ok(false)` without installing anything when the session was
/// logged out (or `cancel` fired) during the handshake. The check and the
/// install happen under the transport slot lock, so a concurrent
/// [`PresenceSession::disconnect`] either sees the new client and closes it
/// or makes this call drop it.
async fn open_transport(
    ctx: &SessionContext,
    identity: &ClientIdentity,
    cancel: Option<&CancellationToken>,
) -> Result<bool, ClientError> {
    let (client, events) = WsClient::connect(&ctx.base_url, identity).await?;

    let mut slot = ctx.client.lock().await;
    let abandoned = ctx.manual_disconnect.load(Ordering::SeqCst)
        || cancel.is_some_and(CancellationToken::is_cancelled);
    if abandoned {
        drop(slot);
        client.close().await;
        ctx.set_state(ConnectionState::Disconnected).await;
        return Ok(false);
    }

    let generation = ctx.generation.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(old) = slot.replace(Arc::new(client)) {
        old.close().await;
    }
    ctx.set_state(ConnectionState::Connected).await;
    drop(slot);

    tokio::spawn(drive(events, ctx.clone(), generation));
    Ok(true)
}

/// Applies transport events to the cache until the transport ends.
///
/// Returns a boxed future to break the type cycle
/// `drive` → `reconnect_loop` → `open_transport` → `drive`.
fn drive(
    mut events: mpsc::Receiver<WsEvent>,
    ctx: SessionContext,
    generation: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        while let Some(event) = events.recv().await {
            if ctx.generation.load(Ordering::SeqCst) != generation {
                trace!(generation, "event from replaced transport ignored");
                return;
            }
            match event {
                WsEvent::Presence(online) => {
                    ctx.cache.replace(online.clone());
                    ctx.emit(ClientEvent::PresenceUpdated(online));
                }
                WsEvent::Closed(close) => {
                    ctx.transport_closed(generation, close).await;
                    return;
                }
            }
        }
        // Channel gone without a close event: the client was dropped.
        ctx.transport_closed(generation, None).await;
    })
}

/// Reconnects with exponential backoff until it succeeds, is cancelled or
/// runs out of attempts.
async fn reconnect_loop(ctx: SessionContext, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        attempt = attempt.saturating_add(1);
        if ctx.reconnect_config.exhausted(attempt) {
            warn!(attempts = attempt - 1, "giving up on presence reconnect");
            ctx.set_state(ConnectionState::Disconnected).await;
            return;
        }

        let delay = ctx.reconnect_config.delay_for_attempt(attempt);
        let delay_secs = delay.as_secs_f64();

        ctx.set_state(ConnectionState::Reconnecting { attempt }).await;
        ctx.emit(ClientEvent::Reconnecting {
            attempt,
            next_retry_secs: delay_secs,
        });
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            "reconnecting presence transport"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(identity) = ctx.identity.lock().await.clone() else {
            return;
        };
        if cancel.is_cancelled() {
            return;
        }

        match open_transport(&ctx, &identity, Some(&cancel)).await {
            Ok(true) => {
                info!(user = %identity.user_id, attempt, "presence transport restored");
                return;
            }
            Ok(false) => {
                debug!(attempt, "reconnect abandoned after logout");
                return;
            }
            Err(e) => {
                debug!(attempt, "reconnect attempt failed: {e}");
            }
        }
    }
}

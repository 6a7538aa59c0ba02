//! WebSocket client for the presence endpoint.
//!
//! Opens the transport with the identity claim in the query string, turns
//! server pushes into [`WsEvent`]s and supports request/response with id
//! correlation for keepalive pings.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use parley_protocol::constants::{
    MessageType, QUERY_TOKEN, QUERY_USER_ID, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use parley_protocol::envelope::Message;
use parley_protocol::presence::OnlineSet;

use crate::ClientError;
use crate::types::{ClientIdentity, ServerClose};

/// Capacity of the outbound frame queue.
const WRITE_BUFFER_SIZE: usize = 64;

/// Capacity of the inbound event queue.
const EVENT_BUFFER_SIZE: usize = 64;

/// Requests awaiting a response, keyed by message id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Something the server did that the session has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// A `getOnlineUsers` push.
    Presence(OnlineSet),
    /// The transport ended. Carries the server's close frame, if any.
    Closed(Option<ServerClose>),
}

/// Builds the presence endpoint URL for `identity`.
///
/// `ws://host:port` becomes `ws://host:port/?userId=<id>[&token=<token>]`.
pub fn presence_url(base: &str, identity: &ClientIdentity) -> Result<Url, ClientError> {
    let mut url = Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(QUERY_USER_ID, identity.user_id.as_str());
        if let Some(token) = &identity.token {
            query.append_pair(QUERY_TOKEN, token);
        }
    }
    Ok(url)
}

/// WebSocket client connected to the presence server.
pub struct WsClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl WsClient {
    /// Opens the presence transport for `identity`.
    ///
    /// Returns the client and the receiver for server pushes. The receiver
    /// yields a final [`WsEvent::Closed`] when the transport ends.
    pub async fn connect(
        base_url: &str,
        identity: &ClientIdentity,
    ) -> Result<(Self, mpsc::Receiver<WsEvent>), ClientError> {
        let url = presence_url(base_url, identity)?;

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false)
                .await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_BUFFER_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));

        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            events_tx,
            write_tx.clone(),
            cancel.clone(),
        ));

        tracing::debug!(user = %identity.user_id, "presence transport open");

        let client = Self {
            write_tx,
            pending,
            _read_handle: read_handle,
            _write_handle: write_handle,
            cancel,
        };
        Ok((client, events_rx))
    }

    /// Sends a request and waits for the response with the same id.
    pub async fn send_request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, ClientError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)?;

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => match &resp.error {
                Some(err) => Err(ClientError::Server {
                    code: err.code,
                    message: err.message.clone(),
                }),
                None => Ok(resp),
            },
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Application-level round trip (`ping` → `pong`).
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send_request::<()>(MessageType::Ping, None).await?;
        Ok(())
    }

    /// Returns `true` while both pumps are running.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.write_tx.is_closed()
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        let _ = self.write_tx.try_send(tungstenite::Message::Close(None));
        self.cancel.cancel();
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}

//! Per-connection plumbing: read/write pumps, ping/pong, send buffering.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use parley_protocol::constants::{
    MessageType, WS_CLOSE_GOING_AWAY, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE,
    WS_PING_PERIOD, WS_PONG_WAIT,
};
use parley_protocol::envelope::Message;
use parley_protocol::presence::UserId;

use crate::SEND_BUFFER_SIZE;
use crate::lifecycle::{ConnectionPhase, Lifecycle, LifecycleEvent};

/// Unique identity of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata about a connected peer.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionMeta {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            connected_at: Utc::now(),
        }
    }
}

/// Handle for queueing frames to one connection.
///
/// Cloneable and cheap: wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Queues a protocol [`Message`] as JSON text.
    ///
    /// Never waits: returns `Err` if the queue is full or the connection
    /// is gone.
    pub fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError)?;
        self.send_text(json)
    }

    /// Queues an already serialized JSON frame.
    pub(crate) fn send_text(&self, json: String) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Text(json.into()))
            .map_err(|_| SendError)
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(&req.reply_error(code, message))
    }

    /// Queues a close frame; the write pump tears the connection down after
    /// flushing it.
    pub fn send_close(&self, code: u16, reason: &str) -> Result<(), SendError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.tx
            .try_send(WsMessage::Close(Some(frame)))
            .map_err(|_| SendError)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Reference to a live connection, as stored in the registry.
///
/// Two handles are equal when they refer to the same transport session.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    meta: Arc<ConnectionMeta>,
    sender: Sender,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected() && !self.cancel.is_cancelled()
    }

    /// Closes the connection with the given close code.
    ///
    /// Falls back to an immediate teardown when the close frame cannot be
    /// queued.
    pub fn close_with(&self, code: u16, reason: &str) {
        if self.sender.send_close(code, reason).is_err() {
            self.cancel.cancel();
        }
    }

    /// Builds a handle backed by a plain channel, for exercising the
    /// registry and broadcaster without a socket.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: ConnectionId::new(),
            meta: Arc::new(ConnectionMeta::new("test")),
            sender: Sender { tx },
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.meta.remote_addr)
            .finish()
    }
}

/// Starts the pumps for an accepted, authenticated WebSocket.
///
/// The connection task announces itself with [`LifecycleEvent::Opened`]
/// before reading any frame and reports [`LifecycleEvent::Closed`] once the
/// read side ends, so the hub always sees the two events in order.
pub(crate) fn spawn_connection<S>(
    ws_stream: S,
    meta: ConnectionMeta,
    mut lifecycle: Lifecycle,
    identity: Option<UserId>,
    events: mpsc::Sender<LifecycleEvent>,
    server_cancel: &CancellationToken,
    tasks: &TaskTracker,
) -> ConnectionHandle
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let handle = ConnectionHandle {
        id: lifecycle.connection_id(),
        meta: Arc::new(meta),
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tasks.spawn(write_pump(ws_sink, rx, cancel.clone()));

    let opened = handle.clone();
    tasks.spawn(async move {
        let connection = opened.id();
        if events
            .send(LifecycleEvent::Opened {
                handle: opened.clone(),
                identity: identity.clone(),
            })
            .await
            .is_err()
        {
            tracing::warn!(conn = %connection, "presence hub gone, dropping connection");
            cancel.cancel();
            return;
        }

        read_pump(ws_stream, sender, cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();

        if let Err(e) = lifecycle.advance(ConnectionPhase::Closed) {
            tracing::error!(conn = %connection, "{e}");
        }
        let _ = events
            .send(LifecycleEvent::Closed {
                connection,
                identity: identity.clone(),
            })
            .await;

        let online_for = chrono::Utc::now() - opened.meta().connected_at;
        tracing::info!(
            conn = %connection,
            user = identity.as_ref().map(UserId::as_str).unwrap_or("-"),
            secs = online_for.num_seconds(),
            "user disconnected"
        );
    });

    handle
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::from(WS_CLOSE_GOING_AWAY),
                    reason: "going away".into(),
                };
                let _ = sink.send(WsMessage::Close(Some(frame))).await;
                break;
            }

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        let closing = matches!(ws_msg, WsMessage::Close(_));
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::debug!("write pump send error: {e}");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best effort; the peer may already be gone.
    let _ = sink.close().await;
    cancel.cancel();
}

/// Read pump: reads WS frames until the peer goes away.
///
/// Any incoming frame resets the pong deadline; silence longer than
/// [`WS_PONG_WAIT`] counts as a dead peer.
async fn read_pump<S>(mut stream: S, sender: Sender, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                tracing::warn!("pong timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        pong_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(&sender, &text);
                            }
                            WsMessage::Binary(_) => {
                                tracing::debug!("ignoring binary frame");
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(frame) => {
                                tracing::debug!(reason = ?frame, "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Answers client-initiated protocol messages.
///
/// Presence is push-only; the only request a client may make is `ping`.
fn dispatch_text(sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("invalid message JSON: {e}");
            return;
        }
    };

    match msg.msg_type {
        MessageType::Ping => match msg.reply::<()>(MessageType::Pong, None) {
            Ok(reply) => {
                let _ = sender.send_msg(&reply);
            }
            Err(e) => tracing::error!("failed to build pong: {e}"),
        },
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_json(rx: &mut mpsc::Receiver<WsMessage>) -> Message {
        match rx.try_recv().expect("a queued frame") {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[test]
    fn handles_compare_by_connection_id() {
        let (a, _rx_a) = ConnectionHandle::detached(1);
        let (b, _rx_b) = ConnectionHandle::detached(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn send_fails_when_buffer_full() {
        let (handle, _rx) = ConnectionHandle::detached(1);
        let sender = handle.sender();
        assert!(sender.send_text("{}".into()).is_ok());
        assert!(sender.send_text("{}".into()).is_err());
    }

    #[test]
    fn close_with_queues_close_frame() {
        let (handle, mut rx) = ConnectionHandle::detached(4);
        handle.close_with(4002, "superseded");
        match rx.try_recv().unwrap() {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4002);
                assert_eq!(frame.reason.as_str(), "superseded");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        // Queued successfully, so no hard teardown yet.
        assert!(handle.is_connected());
    }

    #[test]
    fn close_with_falls_back_to_cancel_when_full() {
        let (handle, _rx) = ConnectionHandle::detached(1);
        handle.sender().send_text("{}".into()).unwrap();
        handle.close_with(4002, "superseded");
        assert!(!handle.is_connected());
    }

    #[test]
    fn dispatch_ping_replies_pong_with_same_id() {
        let (handle, mut rx) = ConnectionHandle::detached(4);
        dispatch_text(&handle.sender(), r#"{"id":"p-1","type":"ping"}"#);
        let reply = recv_json(&mut rx);
        assert_eq!(reply.id, "p-1");
        assert_eq!(reply.msg_type, MessageType::Pong);
    }

    #[test]
    fn dispatch_unknown_replies_not_implemented() {
        let (handle, mut rx) = ConnectionHandle::detached(4);
        dispatch_text(&handle.sender(), r#"{"id":"m-1","type":"sendMessage"}"#);
        let reply = recv_json(&mut rx);
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, WS_ERR_CODE_NOT_IMPLEMENTED);
    }

    #[test]
    fn dispatch_ignores_malformed_json() {
        let (handle, mut rx) = ConnectionHandle::detached(4);
        dispatch_text(&handle.sender(), "not json {{");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_pump_exits_on_stream_end() {
        let (handle, _rx) = ConnectionHandle::detached(4);
        let empty = futures_util::stream::empty::<
            Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
        >();
        read_pump(empty, handle.sender(), CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn read_pump_times_out_on_silence() {
        tokio::time::pause();
        let (handle, _rx) = ConnectionHandle::detached(4);
        let silent = futures_util::stream::pending::<
            Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
        >();
        // With paused time the deadline elapses as soon as the runtime idles.
        read_pump(silent, handle.sender(), CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn write_pump_sends_close_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<WsMessage>(16);
        let sink = futures_util::sink::unfold(sink_tx, |tx, msg: WsMessage| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tokio_tungstenite::tungstenite::Error>(tx)
        });
        let sink = Box::pin(sink);

        let (_tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let handle = tokio::spawn(async move { write_pump(sink, rx, c).await });

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        match sink_rx.recv().await {
            Some(WsMessage::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), WS_CLOSE_GOING_AWAY);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

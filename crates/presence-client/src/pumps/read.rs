//! WebSocket read pump: routes responses and turns pushes into events.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use parley_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use parley_protocol::envelope::Message;
use parley_protocol::presence::OnlineSet;

use crate::types::ServerClose;
use crate::ws_client::{PendingMap, WsEvent};

/// Reads frames until the transport ends, then emits [`WsEvent::Closed`].
///
/// Any incoming frame resets the pong deadline; silence longer than
/// [`WS_PONG_WAIT`] counts as a dead server.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    events: mpsc::Sender<WsEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    let mut server_close = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, presence transport dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &events).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Close(frame) => {
                                server_close = frame.map(|f| ServerClose {
                                    code: u16::from(f.code),
                                    reason: f.reason.to_string(),
                                });
                                debug!(close = ?server_close, "server closed presence transport");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = events.send(WsEvent::Closed(server_close)).await;
}

async fn handle_text_message(text: &str, pending: &PendingMap, events: &mpsc::Sender<WsEvent>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    if let Some(tx) = pending.lock().await.remove(&msg.id) {
        let _ = tx.send(msg);
        return;
    }

    match msg.msg_type {
        MessageType::GetOnlineUsers => match msg.parse_payload::<OnlineSet>() {
            Ok(Some(online)) => {
                trace!(online = online.len(), "presence push");
                let _ = events.send(WsEvent::Presence(online)).await;
            }
            Ok(None) => warn!(id = %msg.id, "presence push without payload"),
            Err(e) => warn!(id = %msg.id, "malformed presence payload: {e}"),
        },
        _ => trace!(msg_type = ?msg.msg_type, id = %msg.id, "ignoring unsolicited message"),
    }
}

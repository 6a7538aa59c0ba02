//! Presence fan-out to every active connection.

use std::collections::HashMap;

use parley_protocol::envelope::Message;
use parley_protocol::presence::OnlineSet;

use crate::connection::{ConnectionHandle, ConnectionId, Sender};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose queue was full or already closed. They catch up on the
    /// next push, which carries the full set again.
    pub dropped: usize,
}

/// Pushes the full online set to every attached connection.
///
/// Attached connections include anonymous ones: they receive presence but
/// never appear in it.
#[derive(Default)]
pub struct Broadcaster {
    peers: HashMap<ConnectionId, Sender>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, handle: &ConnectionHandle) {
        self.peers.insert(handle.id(), handle.sender());
    }

    /// Returns `false` if the connection was not attached.
    pub fn detach(&mut self, connection: ConnectionId) -> bool {
        self.peers.remove(&connection).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Sends one `getOnlineUsers` push to every attached connection.
    ///
    /// Never waits on a peer: delivery is a non-blocking enqueue.
    pub fn broadcast(&self, online: &OnlineSet) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if self.peers.is_empty() {
            return report;
        }

        let json = match Message::online_users(uuid::Uuid::new_v4().to_string(), online)
            .and_then(|msg| serde_json::to_string(&msg))
        {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to encode presence push: {e}");
                return report;
            }
        };

        for (id, sender) in &self.peers {
            match sender.send_text(json.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    tracing::debug!(conn = %id, "presence push dropped");
                    report.dropped += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::constants::MessageType;
    use parley_protocol::presence::UserId;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    use super::*;

    fn online(ids: &[&str]) -> OnlineSet {
        ids.iter().copied().map(UserId::from).collect()
    }

    fn recv_online(rx: &mut mpsc::Receiver<WsMessage>) -> OnlineSet {
        match rx.try_recv().expect("a presence push") {
            WsMessage::Text(text) => {
                let msg: Message = serde_json::from_str(&text).unwrap();
                assert_eq!(msg.msg_type, MessageType::GetOnlineUsers);
                msg.parse_payload().unwrap().unwrap()
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn pushes_full_set_to_every_peer() {
        let mut b = Broadcaster::new();
        let (h1, mut rx1) = ConnectionHandle::detached(4);
        let (h2, mut rx2) = ConnectionHandle::detached(4);
        b.attach(&h1);
        b.attach(&h2);

        let report = b.broadcast(&online(&["u1", "u2"]));
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });
        assert_eq!(recv_online(&mut rx1), online(&["u1", "u2"]));
        assert_eq!(recv_online(&mut rx2), online(&["u1", "u2"]));
        assert!(rx1.try_recv().is_err(), "exactly one push per broadcast");
    }

    #[test]
    fn detached_peer_gets_nothing() {
        let mut b = Broadcaster::new();
        let (h1, mut rx1) = ConnectionHandle::detached(4);
        b.attach(&h1);
        assert!(b.detach(h1.id()));
        assert!(!b.detach(h1.id()));

        assert_eq!(b.broadcast(&online(&["u1"])), BroadcastReport::default());
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn full_queue_misses_update_without_blocking() {
        let mut b = Broadcaster::new();
        let (slow, mut slow_rx) = ConnectionHandle::detached(1);
        let (fast, mut fast_rx) = ConnectionHandle::detached(4);
        b.attach(&slow);
        b.attach(&fast);

        b.broadcast(&online(&["u1"]));
        let report = b.broadcast(&online(&["u1", "u2"]));
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);

        // The slow peer still holds the older set; the next push heals it.
        assert_eq!(recv_online(&mut slow_rx), online(&["u1"]));
        b.broadcast(&online(&["u2"]));
        assert_eq!(recv_online(&mut slow_rx), online(&["u2"]));

        assert_eq!(recv_online(&mut fast_rx), online(&["u1"]));
        assert_eq!(recv_online(&mut fast_rx), online(&["u1", "u2"]));
        assert_eq!(recv_online(&mut fast_rx), online(&["u2"]));
    }

    #[test]
    fn empty_set_is_pushed_not_skipped() {
        let mut b = Broadcaster::new();
        let (h, mut rx) = ConnectionHandle::detached(4);
        b.attach(&h);
        b.broadcast(&OnlineSet::new());
        assert!(recv_online(&mut rx).is_empty());
    }
}

//! Client-side copy of the server's online set.

use tokio::sync::watch;

use parley_protocol::presence::OnlineSet;

/// Last online set received from the server.
///
/// Every push replaces the cached set; nothing is merged. Observers can
/// [`subscribe`](Self::subscribe) to be woken on each replacement.
#[derive(Debug)]
pub struct PresenceCache {
    tx: watch::Sender<OnlineSet>,
}

impl Default for PresenceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(OnlineSet::new());
        Self { tx }
    }

    /// Replaces the cached set with `online`.
    pub fn replace(&self, online: OnlineSet) {
        self.tx.send_replace(online);
    }

    /// Empties the cache (logout).
    pub fn clear(&self) {
        self.tx.send_replace(OnlineSet::new());
    }

    pub fn online_users(&self) -> OnlineSet {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.tx.borrow().contains(user_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<OnlineSet> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::presence::UserId;

    use super::*;

    fn online(ids: &[&str]) -> OnlineSet {
        ids.iter().copied().map(UserId::from).collect()
    }

    #[test]
    fn starts_empty() {
        let cache = PresenceCache::new();
        assert!(cache.online_users().is_empty());
        assert!(!cache.is_online("u1"));
    }

    #[test]
    fn push_replaces_rather_than_merges() {
        let cache = PresenceCache::new();
        cache.replace(online(&["u1", "u2"]));
        cache.replace(online(&["u3"]));
        assert_eq!(cache.online_users(), online(&["u3"]));
        assert!(!cache.is_online("u1"));
        assert!(cache.is_online("u3"));
    }

    #[test]
    fn clear_empties() {
        let cache = PresenceCache::new();
        cache.replace(online(&["u1"]));
        cache.clear();
        assert!(cache.online_users().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_replacements() {
        let cache = PresenceCache::new();
        let mut rx = cache.subscribe();

        cache.replace(online(&["u1"]));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), online(&["u1"]));

        cache.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }
}

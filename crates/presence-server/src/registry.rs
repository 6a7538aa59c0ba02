//! Connection registry: which user currently holds which live connection.
//!
//! At most one entry exists per identity; the most recent connection wins.
//! Removal is guarded by connection id, so a late disconnect from a
//! superseded connection never evicts its successor.

use std::collections::HashMap;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use parley_protocol::presence::{OnlineSet, UserId};

use crate::connection::{ConnectionHandle, ConnectionId};

/// A boxed future returned by registry operations.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Register / deregister / snapshot capability.
///
/// The hub only talks to the registry through this trait, so a shared
/// backing store can replace [`InMemoryRegistry`] when presence has to span
/// several processes.
pub trait PresenceRegistry: Send + Sync + 'static {
    /// Inserts or replaces the entry for `identity`.
    ///
    /// Returns the displaced handle when a *different* connection was
    /// registered under the same identity.
    fn register(
        &self,
        identity: UserId,
        handle: ConnectionHandle,
    ) -> RegistryFuture<'_, Option<ConnectionHandle>>;

    /// Removes the entry for `identity` only if it still points at
    /// `connection`. Returns whether an entry was removed.
    fn deregister<'a>(
        &'a self,
        identity: &'a UserId,
        connection: ConnectionId,
    ) -> RegistryFuture<'a, bool>;

    /// Current set of online identities.
    fn snapshot(&self) -> RegistryFuture<'_, OnlineSet>;
}

/// Single-process registry guarded by a mutex.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, ConnectionHandle>> {
        // A panic while holding the lock cannot leave the map half-written:
        // every critical section is a single insert/remove/iterate.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous form of [`PresenceRegistry::register`].
    pub fn insert(&self, identity: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.lock().insert(identity, handle.clone());
        previous.filter(|old| *old != handle)
    }

    /// Synchronous form of [`PresenceRegistry::deregister`].
    pub fn remove_if_current(&self, identity: &UserId, connection: ConnectionId) -> bool {
        let mut entries = self.lock();
        match entries.get(identity) {
            Some(current) if current.id() == connection => {
                entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Synchronous form of [`PresenceRegistry::snapshot`].
    pub fn online(&self) -> OnlineSet {
        self.lock().keys().cloned().collect()
    }

    /// Returns the handle registered for `identity`, if any.
    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.lock().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl PresenceRegistry for InMemoryRegistry {
    fn register(
        &self,
        identity: UserId,
        handle: ConnectionHandle,
    ) -> RegistryFuture<'_, Option<ConnectionHandle>> {
        Box::pin(future::ready(self.insert(identity, handle)))
    }

    fn deregister<'a>(
        &'a self,
        identity: &'a UserId,
        connection: ConnectionId,
    ) -> RegistryFuture<'a, bool> {
        Box::pin(future::ready(self.remove_if_current(identity, connection)))
    }

    fn snapshot(&self) -> RegistryFuture<'_, OnlineSet> {
        Box::pin(future::ready(self.online()))
    }
}

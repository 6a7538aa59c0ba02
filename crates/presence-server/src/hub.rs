//! Presence hub: the single consumer of lifecycle events.
//!
//! Every registry mutation and the fan-out that follows it happen on this
//! task, one event at a time, so peers observe pushes in mutation order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_protocol::constants::WS_CLOSE_SUPERSEDED;

use crate::broadcaster::{BroadcastReport, Broadcaster};
use crate::lifecycle::LifecycleEvent;
use crate::registry::PresenceRegistry;

/// Applies lifecycle events to the registry and broadcasts the result.
pub struct PresenceHub<R: PresenceRegistry> {
    registry: Arc<R>,
    broadcaster: Broadcaster,
    close_superseded: bool,
    /// Active connections, shared with the server for diagnostics.
    active: Arc<AtomicUsize>,
}

impl<R: PresenceRegistry> PresenceHub<R> {
    pub fn new(registry: Arc<R>, close_superseded: bool) -> Self {
        Self {
            registry,
            broadcaster: Broadcaster::new(),
            close_superseded,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of active (attached) connections.
    pub fn active_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    /// Consumes events until cancelled or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event).await;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("presence hub stopped");
    }

    /// Applies one event and broadcasts the resulting online set.
    pub async fn handle(&mut self, event: LifecycleEvent) -> BroadcastReport {
        match event {
            LifecycleEvent::Opened { handle, identity } => {
                self.broadcaster.attach(&handle);

                match identity {
                    Some(user) => {
                        tracing::info!(
                            user = %user,
                            conn = %handle.id(),
                            remote = %handle.meta().remote_addr,
                            "user connected"
                        );
                        let displaced = self.registry.register(user.clone(), handle).await;
                        if let Some(old) = displaced {
                            if self.close_superseded {
                                tracing::info!(user = %user, conn = %old.id(), "closing superseded connection");
                                old.close_with(WS_CLOSE_SUPERSEDED, "superseded by a newer connection");
                            } else {
                                tracing::debug!(user = %user, conn = %old.id(), "superseded connection left open");
                            }
                        }
                    }
                    None => {
                        tracing::info!(conn = %handle.id(), "connection without identity claim, not registered");
                    }
                }
            }

            LifecycleEvent::Closed {
                connection,
                identity,
            } => {
                self.broadcaster.detach(connection);

                if let Some(user) = identity {
                    let removed = self.registry.deregister(&user, connection).await;
                    if !removed {
                        tracing::debug!(user = %user, conn = %connection, "stale disconnect, newer connection kept");
                    }
                }
            }
        }

        self.active.store(self.broadcaster.len(), Ordering::Relaxed);
        self.publish().await
    }

    async fn publish(&self) -> BroadcastReport {
        let online = self.registry.snapshot().await;
        let report = self.broadcaster.broadcast(&online);
        tracing::debug!(
            online = online.len(),
            delivered = report.delivered,
            dropped = report.dropped,
            "presence broadcast"
        );
        report
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

pub type ConnectionId = u64;

/// Shared channel registry: group slug to the set of live connections
/// subscribed to it. The lock scope never contains I/O; `publish` snapshots
/// the sender set under the lock and delivers outside it.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnectionId,
    channels: HashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<String>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under a channel. The returned receiver carries
    /// fan-out payloads; the sender handle lets the connection's own task
    /// push frames (e.g. error frames) to itself.
    pub fn subscribe(
        &self,
        slug: &str,
    ) -> (
        ConnectionId,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let connection_id = inner.next_id;
        inner
            .channels
            .entry(slug.to_string())
            .or_default()
            .insert(connection_id, tx.clone());
        debug!(%slug, connection_id, "connection subscribed");
        (connection_id, tx, rx)
    }

    /// Removes a connection. Idempotent: error paths and the normal close
    /// path may both call this.
    pub fn unsubscribe(&self, slug: &str, connection_id: ConnectionId) {
        let mut inner = self.lock();
        if let Some(connections) = inner.channels.get_mut(slug) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                inner.channels.remove(slug);
            }
        }
    }

    /// Pushes a serialized payload to every connection on the channel.
    /// Returns the delivered count; individual send failures (receiver
    /// already gone) are skipped, never fatal.
    pub fn publish(&self, slug: &str, payload: &str) -> usize {
        let targets: Vec<mpsc::UnboundedSender<String>> = {
            let inner = self.lock();
            inner
                .channels
                .get(slug)
                .map(|connections| connections.values().cloned().collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for target in targets {
            if target.send(payload.to_string()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, slug: &str) -> usize {
        self.lock()
            .channels
            .get(slug)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let registry = ChannelRegistry::new();
        let (_id_a, _tx_a, mut rx_a) = registry.subscribe("movie-fans");
        let (_id_b, _tx_b, mut rx_b) = registry.subscribe("movie-fans");

        let delivered = registry.publish("movie-fans", "payload");
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.as_deref(), Some("payload"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let registry = ChannelRegistry::new();
        let (_id_a, _tx_a, mut rx_a) = registry.subscribe("room-a");
        let (_id_b, _tx_b, _rx_b) = registry.subscribe("room-b");

        assert_eq!(registry.publish("room-a", "only-a"), 1);
        assert_eq!(rx_a.recv().await.as_deref(), Some("only-a"));
        assert_eq!(registry.subscriber_count("room-b"), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (id, _tx, _rx) = registry.subscribe("movie-fans");

        registry.unsubscribe("movie-fans", id);
        registry.unsubscribe("movie-fans", id);
        registry.unsubscribe("never-existed", 99);

        assert_eq!(registry.subscriber_count("movie-fans"), 0);
        assert_eq!(registry.publish("movie-fans", "nobody"), 0);
    }

    #[test]
    fn dropped_receiver_does_not_block_remaining_deliveries() {
        let registry = ChannelRegistry::new();
        let (_id_dead, _tx_dead, rx_dead) = registry.subscribe("movie-fans");
        let (_id_live, _tx_live, mut rx_live) = registry.subscribe("movie-fans");
        drop(rx_dead);

        let delivered = registry.publish("movie-fans", "payload");
        assert_eq!(delivered, 1);
        assert_eq!(rx_live.try_recv().as_deref().ok(), Some("payload"));
    }

    #[test]
    fn connection_ids_are_unique_across_channels() {
        let registry = ChannelRegistry::new();
        let (id_a, _tx_a, _rx_a) = registry.subscribe("room-a");
        let (id_b, _tx_b, _rx_b) = registry.subscribe("room-b");
        assert_ne!(id_a, id_b);
    }
}

//! Cache of discovered peer features

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::{FeatureSet, PeerId};

#[derive(Debug, Default)]
struct Inner {
    peers: DashMap<PeerId, FeatureSet>,
    changed: Notify,
}

/// Thread-safe map from peer (server or room) to its discovered features
///
/// Entries are keyed by bare JID. A missing entry means "not discovered yet",
/// which is different from an entry whose feature is `false`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityStore {
    inner: Arc<Inner>,
}

impl CapabilityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the features a peer advertised, replacing earlier results
    pub fn insert(&self, peer: &PeerId, features: FeatureSet) {
        self.inner.peers.insert(peer.bare(), features);
        self.inner.changed.notify_waiters();
    }

    /// Features of `peer`, if discovered
    pub fn get(&self, peer: &PeerId) -> Option<FeatureSet> {
        self.inner.peers.get(&peer.bare()).map(|entry| entry.value().clone())
    }

    /// Value of one feature: `None` when the peer or the feature is unknown
    pub fn feature(&self, peer: &PeerId, name: &str) -> Option<bool> {
        self.inner
            .peers
            .get(&peer.bare())
            .and_then(|entry| entry.value().get(name).copied())
    }

    /// Forget everything
    pub fn clear(&self) {
        self.inner.peers.clear();
    }

    /// Number of discovered peers
    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    /// Check if nothing was discovered yet
    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    /// Wait until features of `peer` are known, at most `timeout`
    ///
    /// Returns `None` on timeout.
    pub async fn wait_for(&self, peer: &PeerId, timeout: Duration) -> Option<FeatureSet> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register before checking so a concurrent insert can't be missed
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(features) = self.get(peer) {
                return Some(features);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::features;

    fn room() -> PeerId {
        PeerId::parse("room@conference.example.org").unwrap()
    }

    #[test]
    fn test_absent_is_distinct_from_false() {
        let store = CapabilityStore::new();
        assert!(store.get(&room()).is_none());
        assert_eq!(store.feature(&room(), features::PING), None);

        store.insert(&room(), FeatureSet::from([(features::PING.to_string(), false)]));
        assert!(store.get(&room()).is_some());
        assert_eq!(store.feature(&room(), features::PING), Some(false));
        assert_eq!(store.feature(&room(), features::MUC_UNSECURED), None);
    }

    #[test]
    fn test_keys_are_bare_jids() {
        let store = CapabilityStore::new();
        let occupant = room().with_resource("echo").unwrap();
        store.insert(&occupant, FeatureSet::from([(features::MUC_UNSECURED.to_string(), true)]));
        assert_eq!(store.feature(&room(), features::MUC_UNSECURED), Some(true));
    }

    #[test]
    fn test_clear() {
        let store = CapabilityStore::new();
        store.insert(&room(), FeatureSet::new());
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_wakes_on_insert() {
        let store = CapabilityStore::new();
        let writer = store.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            writer.insert(&room(), FeatureSet::from([(features::PING.to_string(), true)]));
        });

        let started = Instant::now();
        let features = store.wait_for(&room(), Duration::from_secs(10)).await;
        assert!(features.is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let store = CapabilityStore::new();
        let started = Instant::now();
        assert!(store.wait_for(&room(), Duration::from_secs(10)).await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}

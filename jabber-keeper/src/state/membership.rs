//! Set of rooms whose membership the server confirmed

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::PeerId;

#[derive(Debug, Default)]
struct Inner {
    rooms: DashSet<PeerId>,
    changed: Notify,
}

/// Rooms we are confirmed to be in, keyed by bare room JID
///
/// A room is added when the server reflects our own presence back from it,
/// not when the join request is sent.
#[derive(Debug, Clone, Default)]
pub struct RoomMembership {
    inner: Arc<Inner>,
}

impl RoomMembership {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `room` as joined; returns false if it already was
    pub fn insert(&self, room: &PeerId) -> bool {
        let added = self.inner.rooms.insert(room.bare());
        self.inner.changed.notify_waiters();
        added
    }

    /// Drop `room`; returns false if we were not in it
    pub fn remove(&self, room: &PeerId) -> bool {
        self.inner.rooms.remove(&room.bare()).is_some()
    }

    /// Check membership
    pub fn contains(&self, room: &PeerId) -> bool {
        self.inner.rooms.contains(&room.bare())
    }

    /// Snapshot of joined rooms, sorted
    pub fn rooms(&self) -> Vec<PeerId> {
        let mut rooms: Vec<PeerId> = self.inner.rooms.iter().map(|r| r.key().clone()).collect();
        rooms.sort();
        rooms
    }

    /// Forget all rooms
    pub fn clear(&self) {
        self.inner.rooms.clear();
    }

    /// Number of joined rooms
    pub fn len(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Check if no room is joined
    pub fn is_empty(&self) -> bool {
        self.inner.rooms.is_empty()
    }

    /// Wait until `room` is confirmed, at most `timeout`; returns whether it was
    pub async fn wait_for(&self, room: &PeerId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.contains(room) {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.contains(room);
            }
        }
    }
}

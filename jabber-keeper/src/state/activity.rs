//! Last-seen timestamps used to decide when probing is due

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::PeerId;

/// Server-level timestamps, copied out as a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerActivity {
    /// Last time anything was received on the connection
    pub last_activity: Instant,
    /// Last c2s ping sent on this connection, if any
    pub last_ping_sent: Option<Instant>,
    /// Last pong received; starts at connection time
    pub last_pong_received: Instant,
}

impl ServerActivity {
    /// Baseline for a connection established at `now`
    ///
    /// The pong timestamp starts at `now` so that a new connection is
    /// considered healthy until a ping has been sent and gone unanswered.
    pub fn fresh(now: Instant) -> Self {
        Self {
            last_activity: now,
            last_ping_sent: None,
            last_pong_received: now,
        }
    }
}

#[derive(Debug)]
struct Inner {
    rooms: DashMap<PeerId, Instant>,
    server: Mutex<ServerActivity>,
}

/// Per-room and per-connection activity clock
#[derive(Debug, Clone)]
pub struct ActivityClock {
    inner: Arc<Inner>,
}

impl ActivityClock {
    /// Create a clock with a fresh baseline at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: DashMap::new(),
                server: Mutex::new(ServerActivity::fresh(now)),
            }),
        }
    }

    fn server(&self) -> MutexGuard<'_, ServerActivity> {
        // The guarded value is plain data, a panic elsewhere can't leave it half-written
        self.inner.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset to the fresh-connection baseline
    pub fn reset(&self, now: Instant) {
        self.inner.rooms.clear();
        *self.server() = ServerActivity::fresh(now);
    }

    /// Record received traffic; `room` is set when it came from a room
    pub fn touch(&self, room: Option<&PeerId>, now: Instant) {
        if let Some(room) = room {
            self.inner.rooms.insert(room.bare(), now);
        }
        self.server().last_activity = now;
    }

    /// Record that a c2s ping was sent
    pub fn record_ping_sent(&self, now: Instant) {
        self.server().last_ping_sent = Some(now);
    }

    /// Record a c2s pong (also counts as traffic)
    pub fn record_pong(&self, now: Instant) {
        let mut server = self.server();
        server.last_pong_received = now;
        server.last_activity = now;
    }

    /// Last activity seen from `room`, if any
    pub fn room_activity(&self, room: &PeerId) -> Option<Instant> {
        self.inner.rooms.get(&room.bare()).map(|entry| *entry.value())
    }

    /// Number of rooms with an activity record
    pub fn tracked_rooms(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Copy of the server-level timestamps
    pub fn server_snapshot(&self) -> ServerActivity {
        *self.server()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn room() -> PeerId {
        PeerId::parse("room@conference.example.org").unwrap()
    }

    #[test]
    fn test_fresh_baseline() {
        let now = Instant::now();
        let clock = ActivityClock::new(now);
        let snapshot = clock.server_snapshot();
        assert_eq!(snapshot, ServerActivity::fresh(now));
        assert!(snapshot.last_ping_sent.is_none());
        assert!(clock.room_activity(&room()).is_none());
    }

    #[test]
    fn test_touch_and_reset() {
        let start = Instant::now();
        let clock = ActivityClock::new(start);

        let later = start + Duration::from_secs(5);
        clock.touch(Some(&room()), later);
        clock.record_ping_sent(later);
        assert_eq!(clock.room_activity(&room()), Some(later));
        assert_eq!(clock.server_snapshot().last_activity, later);

        let reset_at = start + Duration::from_secs(10);
        clock.reset(reset_at);
        assert_eq!(clock.tracked_rooms(), 0);
        assert_eq!(clock.server_snapshot(), ServerActivity::fresh(reset_at));
    }

    #[test]
    fn test_pong_counts_as_activity() {
        let start = Instant::now();
        let clock = ActivityClock::new(start);
        let later = start + Duration::from_secs(7);
        clock.record_pong(later);

        let snapshot = clock.server_snapshot();
        assert_eq!(snapshot.last_pong_received, later);
        assert_eq!(snapshot.last_activity, later);
    }
}

//! Process-wide shared state
//!
//! Written by the supervisor (resets) and the stanza router (results of
//! discovery, membership confirmations, traffic), read by the probers and
//! the join orchestrator.

pub mod activity;
pub mod capabilities;
pub mod membership;

pub use activity::{ActivityClock, ServerActivity};
pub use capabilities::CapabilityStore;
pub use membership::RoomMembership;

use tokio::time::Instant;

/// Bundle of all stores that are reset together on every reconnection
#[derive(Debug, Clone)]
pub struct SharedState {
    /// Discovered peer features
    pub capabilities: CapabilityStore,
    /// Confirmed room membership
    pub membership: RoomMembership,
    /// Activity timestamps
    pub activity: ActivityClock,
}

impl SharedState {
    /// Create empty stores with a fresh activity baseline
    pub fn new() -> Self {
        Self {
            capabilities: CapabilityStore::new(),
            membership: RoomMembership::new(),
            activity: ActivityClock::new(Instant::now()),
        }
    }

    /// Clear capabilities and membership, reset activity to a baseline at `now`
    pub fn reset(&self, now: Instant) {
        self.capabilities.clear();
        self.membership.clear();
        self.activity.reset(now);
    }

    /// Check if the stores hold nothing learned from a connection
    pub fn is_pristine(&self) -> bool {
        let server = self.activity.server_snapshot();
        self.capabilities.is_empty()
            && self.membership.is_empty()
            && self.activity.tracked_rooms() == 0
            && server.last_ping_sent.is_none()
            && server.last_pong_received == server.last_activity
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

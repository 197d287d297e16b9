//! Session lifecycle: supervisor, room joins, liveness probes, shutdown

pub mod handle;
pub(crate) mod join;
pub mod keeper;
pub mod room_probe;
pub mod server_probe;
pub mod shutdown;
pub(crate) mod supervisor;

pub use handle::{Link, SessionHandle, SessionStatus};
pub use join::JoinOutcome;
pub use keeper::SessionKeeper;
pub use server_probe::ServerProbe;
pub use shutdown::{ShutdownCoordinator, ShutdownReport, Signal};

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::types::{FeatureSet, PeerId, SessionId};

/// Events the stanza router feeds into the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// disco#info result from a server or room
    DiscoInfo {
        /// Responding peer
        from: PeerId,
        /// Advertised features
        features: FeatureSet,
    },
    /// Our own presence was reflected by a room: membership confirmed
    RoomJoined {
        /// Room (bare or occupant JID)
        room: PeerId,
    },
    /// We are no longer in a room
    RoomLeft {
        /// Room (bare or occupant JID)
        room: PeerId,
        /// Whether to join again after the rejoin delay (kick, room restart)
        rejoin: bool,
    },
    /// Reply to one of our pings
    Pong {
        /// Peer that answered
        from: PeerId,
    },
    /// Any other received stanza
    Traffic {
        /// Sender
        from: PeerId,
    },
}

/// Requests handled by the supervisor
#[derive(Debug, Clone)]
pub(crate) enum SessionCommand {
    /// The connection `id` failed and must be replaced
    Reestablish {
        /// Connection the failure was observed on
        id: SessionId,
        /// What went wrong, for the logs
        reason: String,
    },
    /// Join `room` again on connection `id`
    Rejoin {
        /// Connection the request belongs to
        id: SessionId,
        /// Bare room JID
        room: PeerId,
    },
}

/// Random delay in `0..max`, zero when `max` is zero
pub(crate) fn splay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

/// Sleep for `delay` unless shutdown starts first
///
/// Returns false when the session is (or becomes) ShuttingDown.
pub(crate) async fn sleep_unless_shutdown(
    status: &mut watch::Receiver<SessionStatus>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        if status.borrow_and_update().state.is_shutting_down() {
            return false;
        }
        tokio::select! {
            () = &mut sleep => return !status.borrow().state.is_shutting_down(),
            changed = status.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::config;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cut_short_by_shutdown() {
        let (tx, _rx) = flume::unbounded();
        let handle = SessionHandle::new(config(&["a"]), tx).unwrap();
        let mut status = handle.subscribe();

        let started = Instant::now();
        assert!(sleep_unless_shutdown(&mut status, Duration::from_secs(5)).await);
        assert!(started.elapsed() >= Duration::from_secs(5));

        let stopper = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.begin_shutdown();
        });
        let started = Instant::now();
        assert!(!sleep_unless_shutdown(&mut status, Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_splay_bounds() {
        assert_eq!(splay(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(splay(Duration::from_secs(3)) < Duration::from_secs(3));
        }
    }
}

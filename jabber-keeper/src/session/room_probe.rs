//! Room liveness prober
//!
//! Every `muc_ping_delay` each joined room that has been quiet for longer
//! than the idle threshold gets a self-ping, provided the room advertises
//! the self-ping optimisation. Rooms without it are never pinged.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::handle::{Link, SessionHandle, SessionStatus};
use super::splay;
use crate::config::SessionConfig;
use crate::types::{features, PeerId, SessionId};

/// Check if a room is due for a self-ping
pub fn is_due(
    now: Instant,
    last_activity: Option<Instant>,
    self_ping: Option<bool>,
    config: &SessionConfig,
) -> bool {
    let Some(last_activity) = last_activity else {
        return false;
    };

    now.saturating_duration_since(last_activity) >= config.idle_threshold()
        && self_ping == Some(true)
}

/// Joined rooms that should be pinged now
pub(crate) fn due_rooms(handle: &SessionHandle, now: Instant) -> Vec<PeerId> {
    let shared = handle.shared();

    shared
        .membership
        .rooms()
        .into_iter()
        .filter(|room| {
            is_due(
                now,
                shared.activity.room_activity(room),
                shared
                    .capabilities
                    .feature(room, features::MUC_SELF_PING_OPTIMIZATION),
                handle.config(),
            )
        })
        .collect()
}

/// Ping `room` after a random delay; failures are reported on `link`
async fn ping_room(handle: SessionHandle, link: Link, room: PeerId) {
    let config = handle.config();
    tokio::time::sleep(splay(config.ping_splay_delay)).await;

    tracing::debug!("Sending MUC ping from {} to {}", link.connection.identity(), room);
    let reason = match tokio::time::timeout(config.connection_timeout, link.connection.ping_peer(&room)).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("MUC ping to {} failed: {}", room, e),
        Err(_) => format!("MUC ping to {} timed out", room),
    };

    tracing::error!("{}", reason);
    handle.report_failure(&link.id, reason);
}

/// Room prober state across cycles
struct RoomProber {
    handle: SessionHandle,
    status: watch::Receiver<SessionStatus>,
    /// Ping tasks of the connection in `session`
    pings: JoinSet<()>,
    session: Option<SessionId>,
}

impl RoomProber {
    fn new(handle: SessionHandle) -> Self {
        let status = handle.subscribe();
        Self {
            handle,
            status,
            pings: JoinSet::new(),
            session: None,
        }
    }

    /// Drop ping tasks that belong to another connection
    fn follow(&mut self, current: Option<&SessionId>) {
        if self.session.as_ref() != current {
            if !self.pings.is_empty() {
                tracing::debug!("Connection changed, aborting {} room ping(s)", self.pings.len());
            }
            // Dropping the set aborts its tasks
            self.pings = JoinSet::new();
            self.session = current.cloned();
        }
    }

    /// Wait `delay`, following connection changes; false on shutdown
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let current = {
                let status = self.status.borrow_and_update();
                if status.state.is_shutting_down() {
                    return false;
                }
                status.connected_link().map(|link| link.id.clone())
            };
            self.follow(current.as_ref());

            tokio::select! {
                () = &mut sleep => return true,
                changed = self.status.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.pings.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("Room ping task panicked: {}", e);
                }
            }
        }
    }

    fn cycle(&mut self) {
        self.reap();

        let Some(link) = self.handle.link() else {
            tracing::debug!("Not connected, skipping room probe");
            return;
        };
        self.follow(Some(&link.id));

        for room in due_rooms(&self.handle, Instant::now()) {
            self.pings
                .spawn(ping_room(self.handle.clone(), link.clone(), room));
        }
    }

    async fn run(mut self) {
        let delay = self.handle.config().muc_ping_delay;
        while self.wait(delay).await {
            self.cycle();
        }

        self.pings.abort_all();
        tracing::debug!("Room prober stopped");
    }
}

/// Probe loop; returns once shutdown starts
pub(crate) async fn run(handle: SessionHandle) {
    RoomProber::new(handle).run().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Transport;
    use crate::session::{InboundEvent, SessionCommand};
    use crate::testing::{config, room, Call, MockTransport};
    use crate::types::FeatureSet;
    use std::sync::atomic::Ordering;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_is_due() {
        let config = config(&["a"]);
        let start = Instant::now();
        let quiet = start + secs(63);

        assert!(is_due(quiet, Some(start), Some(true), &config));
        assert!(!is_due(start + secs(62), Some(start), Some(true), &config));
        assert!(!is_due(quiet, None, Some(true), &config));
        assert!(!is_due(quiet, Some(start), Some(false), &config));
        assert!(!is_due(quiet, Some(start), None, &config));
    }

    async fn connected_with(
        transport: &MockTransport,
        config: SessionConfig,
    ) -> (SessionHandle, Link, flume::Receiver<SessionCommand>) {
        let (tx, rx) = flume::unbounded();
        let handle = SessionHandle::new(config, tx).unwrap();
        let link = Link {
            id: SessionId::generate(),
            connection: transport.connect().await.unwrap(),
        };
        handle.mark_connecting().unwrap();
        handle.mark_connected(link.clone()).unwrap();
        (handle, link, rx)
    }

    async fn connected(
        transport: &MockTransport,
        rooms: &[&str],
    ) -> (SessionHandle, Link, flume::Receiver<SessionCommand>) {
        connected_with(transport, config(rooms)).await
    }

    fn joined(handle: &SessionHandle, name: &str, self_ping: bool) {
        handle.deliver(InboundEvent::DiscoInfo {
            from: room(name),
            features: FeatureSet::from([(
                features::MUC_SELF_PING_OPTIMIZATION.to_string(),
                self_ping,
            )]),
        });
        handle.deliver(InboundEvent::RoomJoined {
            room: room(name).with_resource("echo").unwrap(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_self_ping_rooms_are_pinged() {
        let transport = MockTransport::new();
        let (handle, _link, rx) = connected(&transport, &["fast", "slow"]).await;
        joined(&handle, "fast", true);
        joined(&handle, "slow", false);

        tokio::spawn(run(handle.clone()));
        tokio::time::sleep(secs(900 + 5)).await;

        assert_eq!(transport.calls()[1..], [Call::Ping(room("fast"))]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_rooms_are_not_pinged() {
        let transport = MockTransport::new();
        let (handle, _link, _rx) = connected(&transport, &["fast"]).await;
        joined(&handle, "fast", true);

        tokio::spawn(run(handle.clone()));
        tokio::time::sleep(secs(880)).await;
        handle.deliver(InboundEvent::Traffic {
            from: room("fast").with_resource("someone").unwrap(),
        });
        tokio::time::sleep(secs(25)).await;

        assert_eq!(transport.count(|c| matches!(c, Call::Ping(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_failure_is_reported() {
        let transport = MockTransport::new();
        transport.faults().ping.store(true, Ordering::SeqCst);
        let (handle, link, rx) = connected(&transport, &["fast"]).await;
        joined(&handle, "fast", true);

        tokio::spawn(run(handle.clone()));

        match rx.recv_async().await.unwrap() {
            SessionCommand::Reestablish { id, .. } => assert_eq!(id, link.id),
            other => panic!("Expected Reestablish, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_change_aborts_pings() {
        let transport = MockTransport::new();
        // Pings wait up to a minute before going out
        let config = config(&["fast"]).with_ping_splay_delay(secs(60));
        let (handle, _link, _rx) = connected_with(&transport, config).await;
        joined(&handle, "fast", true);

        let mut prober = RoomProber::new(handle.clone());
        tokio::time::sleep(secs(200)).await;
        assert!(prober.wait(Duration::ZERO).await);
        prober.cycle();
        assert_eq!(prober.pings.len(), 1);

        handle.mark_disconnected().unwrap();
        assert!(prober.wait(Duration::ZERO).await);
        assert!(prober.pings.is_empty());

        tokio::time::sleep(secs(120)).await;
        assert_eq!(transport.count(|c| matches!(c, Call::Ping(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown() {
        let transport = MockTransport::new();
        let (handle, _link, _rx) = connected(&transport, &["fast"]).await;

        let prober = tokio::spawn(run(handle.clone()));
        tokio::time::sleep(secs(10)).await;
        handle.begin_shutdown();

        tokio::time::timeout(secs(1), prober).await.unwrap().unwrap();
    }
}

//! Shared handle to the session core

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use super::{InboundEvent, SessionCommand};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::network::Connection;
use crate::state::SharedState;
use crate::types::{ConnectionState, PeerId, SessionId};

/// The live connection together with the id it was established under
#[derive(Clone)]
pub struct Link {
    /// Id of this connection
    pub id: SessionId,
    /// The connection itself
    pub connection: Arc<dyn Connection>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("identity", self.connection.identity())
            .finish()
    }
}

/// Connection state and the connection it refers to, published as one value
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Present while Connected, and kept through ShuttingDown for the goodbye
    pub link: Option<Link>,
}

impl SessionStatus {
    /// The link, only if currently connected
    pub fn connected_link(&self) -> Option<&Link> {
        if self.state.is_connected() {
            self.link.as_ref()
        } else {
            None
        }
    }
}

/// Cloneable handle shared by every task of the core
///
/// Gives read access to the connection state and write access to the shared
/// stores. Failure reports and rejoin requests go to the supervisor over a
/// command channel.
#[derive(Clone)]
pub struct SessionHandle {
    config: Arc<SessionConfig>,
    server: PeerId,
    shared: SharedState,
    status: Arc<watch::Sender<SessionStatus>>,
    command_tx: flume::Sender<SessionCommand>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("server", &self.server)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        config: SessionConfig,
        command_tx: flume::Sender<SessionCommand>,
    ) -> Result<Self> {
        let server = config.server_jid()?;
        let (status, _) = watch::channel(SessionStatus::default());

        Ok(Self {
            config: Arc::new(config),
            server,
            shared: SharedState::new(),
            status: Arc::new(status),
            command_tx,
        })
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// JID of the server
    pub fn server(&self) -> &PeerId {
        &self.server
    }

    /// Shared stores
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Snapshot of state and connection
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// The live connection, if connected
    pub fn link(&self) -> Option<Link> {
        self.status.borrow().connected_link().cloned()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Apply `to` to the current state; `link` replaces the published link when given
    ///
    /// Returns the state before the transition.
    fn transition(&self, to: ConnectionState, link: Option<Option<Link>>) -> Result<ConnectionState> {
        let mut outcome = Ok(ConnectionState::default());
        let mut link = link;

        self.status.send_if_modified(|status| match status.state.transition(to) {
            Ok(next) => {
                outcome = Ok(status.state);
                status.state = next;
                if let Some(link) = link.take() {
                    status.link = link;
                }
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        outcome
    }

    /// Disconnected -> Connecting; staying in Connecting is accepted
    pub(crate) fn mark_connecting(&self) -> Result<()> {
        if self.state() == ConnectionState::Connecting {
            return Ok(());
        }
        self.transition(ConnectionState::Connecting, Some(None)).map(|_| ())
    }

    /// Connecting -> Connected, publishing `link`
    pub(crate) fn mark_connected(&self, link: Link) -> Result<()> {
        self.transition(ConnectionState::Connected, Some(Some(link))).map(|_| ())
    }

    /// Connected | Connecting -> Disconnected, dropping the published link
    pub(crate) fn mark_disconnected(&self) -> Result<()> {
        self.transition(ConnectionState::Disconnected, Some(None)).map(|_| ())
    }

    /// Enter ShuttingDown
    ///
    /// Returns the previous state and the link that was live, or `None` when
    /// shutdown had already started.
    pub(crate) fn begin_shutdown(&self) -> Option<(ConnectionState, Option<Link>)> {
        let previous = self.transition(ConnectionState::ShuttingDown, None).ok()?;
        Some((previous, self.status.borrow().link.clone()))
    }

    /// Report that the connection `id` failed
    ///
    /// The supervisor reconnects once per connection; reports about a
    /// connection that was already replaced are ignored.
    pub fn report_failure(&self, id: &SessionId, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!("Failure reported on session {}: {}", id, reason);

        if self
            .command_tx
            .send(SessionCommand::Reestablish {
                id: id.clone(),
                reason,
            })
            .is_err()
        {
            tracing::debug!("Supervisor is gone, dropping failure report for session {}", id);
        }
    }

    /// Ask the supervisor to rejoin `room` on the current connection
    pub fn request_rejoin(&self, room: &PeerId) {
        let Some(link) = self.link() else {
            tracing::debug!("Not connected, {} will be joined on the next connection", room);
            return;
        };

        if self
            .command_tx
            .send(SessionCommand::Rejoin {
                id: link.id,
                room: room.bare(),
            })
            .is_err()
        {
            tracing::debug!("Supervisor is gone, dropping rejoin of {}", room);
        }
    }

    /// Bare room JID if `peer` is one of our rooms
    fn room_of(&self, peer: &PeerId) -> Option<PeerId> {
        let bare = peer.bare();
        if self.shared.membership.contains(&bare) || self.config.rooms.contains(&bare) {
            Some(bare)
        } else {
            None
        }
    }

    /// Feed an event from the stanza router into the shared stores
    pub fn deliver(&self, event: InboundEvent) {
        let now = Instant::now();
        let activity = &self.shared.activity;

        match event {
            InboundEvent::DiscoInfo { from, features } => {
                tracing::debug!("Got disco#info from {}: {} feature(s)", from, features.len());
                activity.touch(self.room_of(&from).as_ref(), now);
                self.shared.capabilities.insert(&from, features);
            }
            InboundEvent::RoomJoined { room } => {
                activity.touch(Some(&room), now);
                if self.shared.membership.insert(&room) {
                    tracing::debug!("Membership in {} confirmed", room.bare());
                }
            }
            InboundEvent::RoomLeft { room, rejoin } => {
                if self.shared.membership.remove(&room) {
                    tracing::info!("Left MUC: {}", room.bare());
                }
                if rejoin {
                    self.request_rejoin(&room);
                }
            }
            InboundEvent::Pong { from } => {
                if from.bare() == self.server {
                    activity.record_pong(now);
                } else {
                    activity.touch(self.room_of(&from).as_ref(), now);
                }
            }
            InboundEvent::Traffic { from } => {
                activity.touch(self.room_of(&from).as_ref(), now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{features, FeatureSet};

    fn handle() -> (SessionHandle, flume::Receiver<SessionCommand>) {
        let room = PeerId::parse("room@conference.example.org").unwrap();
        let config = SessionConfig::new("example.org", "echo").with_rooms(vec![room]);
        let (tx, rx) = flume::unbounded();
        (SessionHandle::new(config, tx).unwrap(), rx)
    }

    #[test]
    fn test_initial_state() {
        let (handle, _rx) = handle();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(handle.link().is_none());
        assert_eq!(handle.server().as_str(), "example.org");
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let (handle, _rx) = handle();
        handle.mark_connecting().unwrap();

        let (previous, link) = handle.begin_shutdown().unwrap();
        assert_eq!(previous, ConnectionState::Connecting);
        assert!(link.is_none());

        assert!(handle.begin_shutdown().is_none());
        assert!(handle.mark_connecting().is_err());
        assert!(handle.mark_disconnected().is_err());
        assert_eq!(handle.state(), ConnectionState::ShuttingDown);
    }

    #[test]
    fn test_report_failure_sends_command() {
        let (handle, rx) = handle();
        let id = SessionId::generate();
        handle.report_failure(&id, "boom");

        match rx.try_recv().unwrap() {
            SessionCommand::Reestablish { id: got, reason } => {
                assert_eq!(got, id);
                assert_eq!(reason, "boom");
            }
            other => panic!("Expected Reestablish, got {:?}", other),
        }
    }

    #[test]
    fn test_rejoin_needs_connection() {
        let (handle, rx) = handle();
        let room = PeerId::parse("room@conference.example.org").unwrap();
        handle.request_rejoin(&room);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_updates_stores() {
        let (handle, _rx) = handle();
        let room = PeerId::parse("room@conference.example.org").unwrap();
        let server = handle.server().clone();

        handle.deliver(InboundEvent::DiscoInfo {
            from: server.clone(),
            features: FeatureSet::from([(features::PING.to_string(), true)]),
        });
        assert_eq!(handle.shared().capabilities.feature(&server, features::PING), Some(true));

        handle.deliver(InboundEvent::RoomJoined {
            room: room.with_resource("echo").unwrap(),
        });
        assert!(handle.shared().membership.contains(&room));
        assert!(handle.shared().activity.room_activity(&room).is_some());

        let before = handle.shared().activity.server_snapshot().last_pong_received;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        handle.deliver(InboundEvent::Pong { from: server });
        assert!(handle.shared().activity.server_snapshot().last_pong_received > before);

        handle.deliver(InboundEvent::RoomLeft { room: room.clone(), rejoin: false });
        assert!(!handle.shared().membership.contains(&room));
    }

    #[test]
    fn test_traffic_from_strangers_is_not_room_activity() {
        let (handle, _rx) = handle();
        let stranger = PeerId::parse("someone@example.net/phone").unwrap();
        handle.deliver(InboundEvent::Traffic { from: stranger.clone() });
        assert!(handle.shared().activity.room_activity(&stranger).is_none());
        assert_eq!(handle.shared().activity.tracked_rooms(), 0);
    }
}

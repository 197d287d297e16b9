//! Supervisor: owns connection establishment and recovery
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::handle::{Link, SessionHandle, SessionStatus};
use super::join;
use super::SessionCommand;
use crate::error::{KeeperError, Result};
use crate::network::{Connection, Transport};
use crate::types::{PeerId, Presence, SessionId};

/// Owns the single logical connection
///
/// Every other task only reports failures; the supervisor is the one place
/// where connections are opened, replaced and torn down. Reports carry the
/// [`SessionId`] they were observed on, and only the first report for the
/// current connection triggers a reconnection.
pub(crate) struct Supervisor {
    handle: SessionHandle,
    transport: Arc<dyn Transport>,
    command_rx: flume::Receiver<SessionCommand>,
    status_rx: watch::Receiver<SessionStatus>,
    /// Join orchestrators of the current connection
    joins: JoinSet<()>,
}

impl Supervisor {
    pub(crate) fn new(
        handle: SessionHandle,
        transport: Arc<dyn Transport>,
        command_rx: flume::Receiver<SessionCommand>,
    ) -> Self {
        let status_rx = handle.subscribe();
        Self {
            handle,
            transport,
            command_rx,
            status_rx,
            joins: JoinSet::new(),
        }
    }

    /// Keep a connection up until shutdown
    pub(crate) async fn run(mut self) {
        loop {
            let Some(link) = self.establish().await else {
                break;
            };

            let reason = match self.announce(&link).await {
                Ok(()) => match self.supervise(&link).await {
                    Some(reason) => reason,
                    None => break,
                },
                Err(e) => e.to_string(),
            };

            if !self.reestablish(link, &reason).await {
                break;
            }
        }

        self.joins.abort_all();
        tracing::debug!("Supervisor stopped");
    }

    /// Block until a verified connection is published as Connected
    ///
    /// Retries forever with the fixed reconnect delay. Returns `None` once
    /// shutdown has started.
    async fn establish(&mut self) -> Option<Link> {
        let config = self.handle.config().clone();

        loop {
            if self.handle.mark_connecting().is_err() {
                return None;
            }

            let connection = match tokio::time::timeout(
                config.connection_timeout,
                self.transport.connect(),
            )
            .await
            {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    tracing::error!("Unable to connect to {}: {}", config.server, e);
                    if !self.pause(config.reconnect_delay).await {
                        return None;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::error!(
                        "Connection to {} timed out after {:?}",
                        config.server,
                        config.connection_timeout
                    );
                    if !self.pause(config.reconnect_delay).await {
                        return None;
                    }
                    continue;
                }
            };

            // A connection that can't carry a keepalive is not handed out
            let keepalive = bounded(
                config.connection_timeout,
                "initial keepalive",
                connection.keepalive(),
            )
            .await;
            if let Err(e) = keepalive {
                tracing::error!("Try to send initial keepalive, got error: {}", e);
                close_quietly(connection.as_ref(), config.connection_timeout).await;
                if !self.pause(config.reconnect_delay).await {
                    return None;
                }
                continue;
            }

            let link = Link {
                id: SessionId::generate(),
                connection,
            };

            // Stores are fresh before anyone can see Connected
            self.handle.shared().reset(Instant::now());
            if self.handle.mark_connected(link.clone()).is_err() {
                close_quietly(link.connection.as_ref(), config.connection_timeout).await;
                return None;
            }

            tracing::info!(
                "Connected to {} as {} (session {})",
                config.server,
                link.connection.identity(),
                link.id
            );
            return Some(link);
        }
    }

    /// Start room joins, send ready presence and discover server features
    async fn announce(&mut self, link: &Link) -> Result<()> {
        for room in self.handle.config().rooms.clone() {
            let handle = self.handle.clone();
            let link = link.clone();
            self.joins.spawn(async move {
                join::run(handle, link, room).await;
            });
        }

        let timeout = self.handle.config().connection_timeout;
        bounded(timeout, "presence", link.connection.send_presence(Presence::ready()))
            .await
            .map_err(|e| {
                KeeperError::transport(format!("Unable to send presence to jabber server: {}", e))
            })?;

        let server = self.handle.server().clone();
        tracing::debug!("Sending disco#info to {}", server);
        bounded(timeout, "disco#info", link.connection.discover_info(&server))
            .await
            .map_err(|e| {
                KeeperError::transport(format!("Unable to send disco#info to {}: {}", server, e))
            })?;

        Ok(())
    }

    /// Serve commands while `link` is live
    ///
    /// Returns the failure reason that ended the connection, or `None` on shutdown.
    async fn supervise(&mut self, link: &Link) -> Option<String> {
        loop {
            tokio::select! {
                command = self.command_rx.recv_async() => match command {
                    Err(_) => {
                        tracing::debug!("Command channel closed");
                        return None;
                    }
                    Ok(SessionCommand::Reestablish { id, reason }) => {
                        if id == link.id {
                            return Some(reason);
                        }
                        tracing::debug!("Ignoring failure report for stale session {}: {}", id, reason);
                    }
                    Ok(SessionCommand::Rejoin { id, room }) => {
                        if id == link.id {
                            self.spawn_rejoin(link, room);
                        } else {
                            tracing::debug!("Ignoring rejoin of {} for stale session {}", room, id);
                        }
                    }
                },
                changed = self.status_rx.changed() => {
                    if changed.is_err() || self.status_rx.borrow_and_update().state.is_shutting_down() {
                        return None;
                    }
                }
                Some(result) = self.joins.join_next(), if !self.joins.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            tracing::error!("Room join task panicked: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn spawn_rejoin(&mut self, link: &Link, room: PeerId) {
        let handle = self.handle.clone();
        let link = link.clone();
        let delay = handle.config().muc_rejoin_delay;

        tracing::info!("Rejoining MUC {} in {:?}", room, delay);
        self.joins.spawn(async move {
            tokio::time::sleep(delay).await;
            join::run(handle, link, room).await;
        });
    }

    /// Tear down `link`, reset shared state and wait before the next attempt
    ///
    /// Returns false if shutdown started meanwhile.
    async fn reestablish(&mut self, link: Link, reason: &str) -> bool {
        let config = self.handle.config().clone();
        tracing::warn!(
            "Session {} lost: {}; reconnecting in {:?}",
            link.id,
            reason,
            config.reconnect_delay
        );

        if self.handle.mark_disconnected().is_err() {
            return false;
        }

        self.joins.abort_all();
        self.handle.shared().reset(Instant::now());
        close_quietly(link.connection.as_ref(), config.connection_timeout).await;

        // Whatever was queued refers to the connection we just dropped
        let stale = self.command_rx.drain().count();
        if stale > 0 {
            tracing::debug!("Dropped {} queued command(s) for session {}", stale, link.id);
        }

        self.pause(config.reconnect_delay).await
    }

    /// Sleep for `delay`; returns false if shutdown started meanwhile
    async fn pause(&mut self, delay: Duration) -> bool {
        super::sleep_unless_shutdown(&mut self.status_rx, delay).await
    }
}

/// Run a transport call, turning a hang past `timeout` into an error
async fn bounded(
    timeout: Duration,
    what: &str,
    call: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| KeeperError::transport(format!("{} timed out after {:?}", what, timeout)))?
}

/// Best-effort close; errors and hangs are only logged
async fn close_quietly(connection: &dyn Connection, timeout: Duration) {
    match tokio::time::timeout(timeout, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Unable to close connection: {}", e),
        Err(_) => tracing::debug!("Closing connection timed out"),
    }
}

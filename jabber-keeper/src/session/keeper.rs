//! SessionKeeper: the entry point that wires the core together

use std::sync::Arc;

use tokio::task::JoinSet;

use super::handle::SessionHandle;
use super::shutdown::{ShutdownCoordinator, ShutdownReport, SignalListener};
use super::supervisor::Supervisor;
use super::{room_probe, server_probe};
use crate::config::SessionConfig;
use crate::error::{KeeperError, Result};
use crate::network::Transport;

/// Keeps one XMPP session and its rooms alive until shutdown
///
/// Owns the supervisor and starts the two liveness probers and the signal
/// listener when run. The stanza router talks to the running keeper through
/// the [`SessionHandle`] returned by [`SessionKeeper::handle`].
///
/// ```rust,no_run
/// # use jabber_keeper::{SessionConfig, SessionKeeper, Transport};
/// # async fn example(transport: impl Transport) -> jabber_keeper::Result<()> {
/// let room = "room@conference.example.org".parse()?;
/// let config = SessionConfig::new("example.org", "echo").with_rooms(vec![room]);
///
/// let keeper = SessionKeeper::new(config, transport)?;
/// let report = keeper.run().await?;
/// println!("Sent {} offline presence(s)", report.presences_sent);
/// # Ok(())
/// # }
/// ```
pub struct SessionKeeper {
    handle: SessionHandle,
    supervisor: Supervisor,
    coordinator: ShutdownCoordinator,
    handle_signals: bool,
}

impl SessionKeeper {
    /// Create a keeper; fails if `config` is unusable
    pub fn new(config: SessionConfig, transport: impl Transport) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) = flume::unbounded();
        let handle = SessionHandle::new(config, command_tx)?;
        let supervisor = Supervisor::new(handle.clone(), Arc::new(transport), command_rx);
        let coordinator = ShutdownCoordinator::new(handle.clone());

        Ok(Self {
            handle,
            supervisor,
            coordinator,
            handle_signals: true,
        })
    }

    /// Handle to feed inbound events and observe the session
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Coordinator that shuts the session down, for embedders that own signal handling
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        self.coordinator.clone()
    }

    /// Whether to install process signal handlers on run (default: true)
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Run until shutdown completes
    ///
    /// Returns the shutdown report once the goodbye has been sent. The
    /// caller is expected to exit the process afterwards.
    pub async fn run(self) -> Result<ShutdownReport> {
        let Self {
            handle,
            supervisor,
            coordinator,
            handle_signals,
        } = self;

        let mut tasks = JoinSet::new();
        if handle_signals {
            let signals = SignalListener::install()?;
            tasks.spawn(coordinator.clone().listen(signals));
        }
        tasks.spawn(server_probe::run(handle.clone()));
        tasks.spawn(room_probe::run(handle.clone()));

        tracing::info!(
            "Keeping session to {} with {} room(s)",
            handle.config().server,
            handle.config().rooms.len()
        );

        // The supervisor may be stuck in a transport call when shutdown lands
        let report = tokio::select! {
            () = supervisor.run() => {
                if !handle.state().is_shutting_down() {
                    tasks.shutdown().await;
                    return Err(KeeperError::Internal(
                        "Supervisor stopped without a shutdown".to_string(),
                    ));
                }
                coordinator.finished().await
            }
            report = coordinator.finished() => report,
        };
        tasks.shutdown().await;
        tracing::info!("Session to {} closed", handle.config().server);
        Ok(report)
    }
}

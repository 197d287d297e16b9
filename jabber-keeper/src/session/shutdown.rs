//! Shutdown coordinator
//!
//! Turns a termination signal into the terminal ShuttingDown state and a
//! best-effort goodbye: offline presence to every joined room, then a close.
//! Errors on the way out are logged and counted, never retried.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use super::handle::{Link, SessionHandle};
use crate::error::Result;
use crate::types::{ConnectionState, Presence};

/// Signals the coordinator listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
    /// SIGHUP
    Hangup,
}

impl Signal {
    /// Whether the signal ends the process
    pub fn is_termination(self) -> bool {
        !matches!(self, Signal::Hangup)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
        };
        f.write_str(name)
    }
}

/// What the goodbye managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// State before ShuttingDown
    pub previous: ConnectionState,
    /// Offline presences delivered to the transport
    pub presences_sent: usize,
    /// Offline presences that failed or timed out
    pub presence_errors: usize,
    /// Whether a close was attempted
    pub close_attempted: bool,
    /// Whether the close succeeded
    pub closed: bool,
}

/// Drives the transition to ShuttingDown
///
/// Cloning shares the completion state: every clone sees the report of the
/// one shutdown that ran.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    handle: SessionHandle,
    report: Arc<watch::Sender<Option<ShutdownReport>>>,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("report", &*self.report.borrow())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        let (report, _) = watch::channel(None);
        Self {
            handle,
            report: Arc::new(report),
        }
    }

    /// Enter ShuttingDown and say goodbye
    ///
    /// The goodbye is only sent when the session was Connected right before
    /// the switch. Returns `None` if shutdown had already started.
    pub async fn shutdown(&self, signal: Signal) -> Option<ShutdownReport> {
        let Some((previous, link)) = self.handle.begin_shutdown() else {
            tracing::debug!("Got {} while already shutting down", signal);
            return None;
        };
        tracing::info!("Shutting down on {} (was {})", signal, previous);

        let mut report = ShutdownReport {
            previous,
            ..Default::default()
        };

        match link {
            Some(link) if previous.is_connected() => self.goodbye(&link, &mut report).await,
            _ => tracing::debug!("Not connected, nothing to say goodbye to"),
        }

        self.report.send_replace(Some(report.clone()));
        Some(report)
    }

    async fn goodbye(&self, link: &Link, report: &mut ShutdownReport) {
        let timeout = self.handle.config().connection_timeout;

        for room in self.handle.shared().membership.rooms() {
            let presence = Presence::offline_in(room.clone());
            match tokio::time::timeout(timeout, link.connection.send_presence(presence)).await {
                Ok(Ok(())) => report.presences_sent += 1,
                Ok(Err(e)) => {
                    tracing::error!("Unable to send offline presence to {}: {}", room, e);
                    report.presence_errors += 1;
                }
                Err(_) => {
                    tracing::error!("Offline presence to {} timed out", room);
                    report.presence_errors += 1;
                }
            }
        }

        report.close_attempted = true;
        match tokio::time::timeout(timeout, link.connection.close()).await {
            Ok(Ok(())) => report.closed = true,
            Ok(Err(e)) => tracing::error!("Unable to close connection: {}", e),
            Err(_) => tracing::error!("Closing connection timed out"),
        }
    }

    /// Wait until a shutdown has run to completion
    pub async fn finished(&self) -> ShutdownReport {
        let mut updates = self.report.subscribe();
        let finished = match updates.wait_for(Option::is_some).await {
            Ok(published) => published.clone().unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        };
        finished
    }

    /// Handle signals until one of them ends the process
    pub(crate) async fn listen(self, mut signals: SignalListener) {
        loop {
            let Some(signal) = signals.recv().await else {
                tracing::warn!("Signal stream closed, no longer listening for signals");
                return;
            };

            if !signal.is_termination() {
                tracing::info!("Got {}, ignoring", signal);
                continue;
            }

            self.shutdown(signal).await;
            return;
        }
    }
}

/// Installed signal handlers
#[cfg(unix)]
pub(crate) struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub(crate) fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    pub(crate) async fn recv(&mut self) -> Option<Signal> {
        tokio::select! {
            s = self.interrupt.recv() => s.map(|()| Signal::Interrupt),
            s = self.terminate.recv() => s.map(|()| Signal::Terminate),
            s = self.quit.recv() => s.map(|()| Signal::Quit),
            s = self.hangup.recv() => s.map(|()| Signal::Hangup),
        }
    }
}

/// Ctrl-C only
#[cfg(not(unix))]
pub(crate) struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub(crate) fn install() -> Result<Self> {
        Ok(Self)
    }

    pub(crate) async fn recv(&mut self) -> Option<Signal> {
        tokio::signal::ctrl_c().await.ok().map(|()| Signal::Interrupt)
    }
}

//! Server liveness prober
//!
//! Every `server_ping_delay` plus jitter the prober looks at how long the
//! connection has been quiet. Quiet connections are probed with a c2s ping
//! when the server advertises `urn:xmpp:ping`, and with a transport keepalive
//! otherwise. A connection whose pings stay unanswered for twice the pong
//! timeout is declared stalled and handed back to the supervisor.

use tokio::time::Instant;

use super::handle::{Link, SessionHandle};
use super::{sleep_unless_shutdown, splay};
use crate::config::SessionConfig;
use crate::state::activity::ServerActivity;
use crate::types::features;

/// What a probe cycle should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProbe {
    /// Recent traffic, nothing to do
    Skip,
    /// Transport-level keepalive
    Keepalive,
    /// Protocol-level c2s ping
    Ping,
    /// Pings went unanswered for too long
    Stalled,
}

/// Decide the probe for one cycle
///
/// `ping_supported` is the server's `urn:xmpp:ping` feature, `None` while
/// undiscovered.
pub fn decide(
    now: Instant,
    activity: &ServerActivity,
    ping_supported: Option<bool>,
    config: &SessionConfig,
) -> ServerProbe {
    if now.saturating_duration_since(activity.last_activity) < config.idle_threshold() {
        return ServerProbe::Skip;
    }

    if ping_supported != Some(true) {
        return ServerProbe::Keepalive;
    }

    let silent = now.saturating_duration_since(activity.last_pong_received);
    if activity.last_ping_sent.is_some() && silent > config.pong_timeout() * 2 {
        ServerProbe::Stalled
    } else {
        ServerProbe::Ping
    }
}

/// Run one probe cycle against `link`
pub(crate) async fn probe_once(handle: &SessionHandle, link: &Link) -> ServerProbe {
    let config = handle.config();
    let server = handle.server();
    let activity = &handle.shared().activity;
    let now = Instant::now();

    let probe = decide(
        now,
        &activity.server_snapshot(),
        handle.shared().capabilities.feature(server, features::PING),
        config,
    );

    let result = match probe {
        ServerProbe::Skip => return probe,
        ServerProbe::Stalled => {
            tracing::warn!("No c2s pong from {} for too long, connection is stalled", server);
            handle.report_failure(&link.id, format!("c2s pong from {} overdue", server));
            return probe;
        }
        ServerProbe::Keepalive => {
            tracing::debug!("Sending keepalive whitespace ping");
            tokio::time::timeout(config.connection_timeout, link.connection.keepalive()).await
        }
        ServerProbe::Ping => {
            tracing::debug!("Sending c2s ping from {} to {}", link.connection.identity(), server);
            tokio::time::timeout(config.connection_timeout, link.connection.ping_peer(server)).await
        }
    };

    match result {
        // Only a ping that left counts toward the stall window
        Ok(Ok(())) if probe == ServerProbe::Ping => activity.record_ping_sent(now),
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Unable to probe {} ({:?}): {}", server, probe, e);
            handle.report_failure(&link.id, format!("{:?} to {} failed: {}", probe, server, e));
        }
        Err(_) => {
            tracing::error!("Probe of {} ({:?}) timed out", server, probe);
            handle.report_failure(&link.id, format!("{:?} to {} timed out", probe, server));
        }
    }
    probe
}

/// Probe loop; returns once shutdown starts
pub(crate) async fn run(handle: SessionHandle) {
    let mut status = handle.subscribe();
    let base = handle.config().server_ping_delay;
    let jitter = handle.config().ping_splay_delay;

    loop {
        if !sleep_unless_shutdown(&mut status, base + splay(jitter)).await {
            break;
        }

        match handle.link() {
            Some(link) => {
                probe_once(&handle, &link).await;
            }
            None => tracing::debug!("Not connected, skipping server probe"),
        }
    }

    tracing::debug!("Server prober stopped");
}

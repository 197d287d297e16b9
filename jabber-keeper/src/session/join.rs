//! Room join orchestrator
//!
//! ## Join Protocol
//!
//! Entering a room takes four round trips, each confirmed asynchronously by
//! the stanza router:
//!
//! 1. disco#info to the room; the answer lands in the capability store
//! 2. wait for the room's features; password-protected rooms are abandoned
//! 3. join request without history
//! 4. wait for our own presence to be reflected (membership), then announce
//!    ready presence in the room
//!
//! Waits in steps 2 and 4 are bounded by the connection timeout. Running out
//! of time is tolerated: the orchestrator carries on as if the answer had
//! come. Transport errors in steps 1, 3 and 4 are reported to the supervisor.

use super::handle::{Link, SessionHandle};
use crate::types::{features, FeatureSet, PeerId, Presence};

/// How a join attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Membership confirmed and ready presence sent
    Joined,
    /// Ready presence sent without a membership confirmation
    Unconfirmed,
    /// Room needs a password; abandoned for good
    PasswordProtected,
    /// A transport call failed; the connection was reported
    Failed,
}

/// Whether discovered room features say a password is needed
pub(crate) fn requires_password(features: &FeatureSet) -> bool {
    features.get(features::MUC_UNSECURED) == Some(&false)
        || features.get(features::MUC_PASSWORD_PROTECTED) == Some(&true)
}

/// Run the join handshake for `room` on `link`
pub(crate) async fn run(handle: SessionHandle, link: Link, room: PeerId) -> JoinOutcome {
    let config = handle.config();
    let timeout = config.connection_timeout;
    let connection = &link.connection;

    tracing::debug!("Sending disco#info from {} to {}", connection.identity(), room);
    if let Err(e) = connection.discover_info(&room).await {
        tracing::info!("Unable to send disco#info to MUC {}: {}", room, e);
        handle.report_failure(&link.id, format!("disco#info to {} failed: {}", room, e));
        return JoinOutcome::Failed;
    }

    match handle.shared().capabilities.wait_for(&room, timeout).await {
        Some(features) if requires_password(&features) => {
            tracing::info!(
                "Unable to join password-protected room {}, giving up on it",
                room
            );
            return JoinOutcome::PasswordProtected;
        }
        Some(_) => {}
        None => {
            tracing::debug!("No disco#info from {} within {:?}, joining anyway", room, timeout);
        }
    }

    if let Err(e) = connection.join_room(&room, &config.nick).await {
        tracing::error!("Unable to join to MUC {}: {}", room, e);
        handle.report_failure(&link.id, format!("join of {} failed: {}", room, e));
        return JoinOutcome::Failed;
    }
    tracing::info!("Joining to MUC: {}", room);

    let confirmed = handle.shared().membership.wait_for(&room, timeout).await;
    if confirmed {
        tracing::info!("Joined to MUC: {}", room);
    } else {
        tracing::warn!("No membership confirmation from {} within {:?}", room, timeout);
    }

    if let Err(e) = connection.send_presence(Presence::ready_in(room.clone())).await {
        tracing::info!("Unable to send presence to MUC {}: {}", room, e);
        handle.report_failure(&link.id, format!("presence to {} failed: {}", room, e));
        return JoinOutcome::Failed;
    }

    if confirmed {
        JoinOutcome::Joined
    } else {
        JoinOutcome::Unconfirmed
    }
}

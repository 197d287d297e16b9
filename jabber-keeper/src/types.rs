/// Core types for the jabber-keeper library
use std::collections::HashMap;

use crate::error::{KeeperError, Result};

/// Feature names as advertised in disco#info responses
pub mod features {
    /// Server supports XEP-0199 c2s pings
    pub const PING: &str = "urn:xmpp:ping";

    /// Room answers self-pings on behalf of its occupants (XEP-0410)
    pub const MUC_SELF_PING_OPTIMIZATION: &str =
        "http://jabber.org/protocol/muc#self-ping-optimization";

    /// Room can be entered without a password
    pub const MUC_UNSECURED: &str = "muc_unsecured";

    /// Room requires a password
    pub const MUC_PASSWORD_PROTECTED: &str = "muc_passwordprotected";
}

/// Discovered features of a single peer, keyed by feature name
pub type FeatureSet = HashMap<String, bool>;

/// Address of a peer: the server, a room, or an occupant of a room
///
/// PeerId must be a plausible JID:
/// - Non-empty, no whitespace
/// - At most one resource separator (`/`)
/// - Non-empty domain part
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Parse and validate a JID
    pub fn parse(jid: impl Into<String>) -> Result<Self> {
        let jid = jid.into();
        Self::validate(&jid)?;
        Ok(PeerId(jid))
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The JID without its resource part
    pub fn bare(&self) -> PeerId {
        match self.0.split_once('/') {
            Some((bare, _)) => PeerId(bare.to_string()),
            None => self.clone(),
        }
    }

    /// Occupant address inside a room, e.g. `room@conference.example.org/nick`
    pub fn with_resource(&self, resource: &str) -> Result<PeerId> {
        PeerId::parse(format!("{}/{}", self.bare(), resource))
    }

    fn validate(s: &str) -> Result<()> {
        if s.is_empty() {
            return Err(KeeperError::InvalidPeerId(
                "Peer id cannot be empty".to_string(),
            ));
        }

        if let Some(ch) = s.chars().find(|c| c.is_whitespace()) {
            return Err(KeeperError::InvalidPeerId(format!(
                "Peer id '{}' contains whitespace {:?}",
                s, ch
            )));
        }

        let mut parts = s.splitn(2, '/');
        let bare = parts.next().unwrap_or_default();
        if let Some(resource) = parts.next() {
            if resource.is_empty() || resource.contains('/') {
                return Err(KeeperError::InvalidPeerId(format!(
                    "Peer id '{}' has an invalid resource part",
                    s
                )));
            }
        }

        let domain = match bare.rsplit_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    return Err(KeeperError::InvalidPeerId(format!(
                        "Peer id '{}' has an empty local part",
                        s
                    )));
                }
                domain
            }
            None => bare,
        };

        if domain.is_empty() {
            return Err(KeeperError::InvalidPeerId(format!(
                "Peer id '{}' has an empty domain",
                s
            )));
        }

        Ok(())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        PeerId::parse(s)
    }
}

/// Identifier of one established connection
///
/// A new id is allocated every time the supervisor brings a connection up.
/// Failure reports carry the id they were observed on, so reports about a
/// connection that has already been replaced can be told apart and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session id
    /// Uses base58 encoding of UUID to keep it short and log friendly
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let encoded = bs58::encode(uuid.as_bytes()).into_string();
        let shortened = encoded.chars().take(12).collect::<String>();
        SessionId(shortened)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection, nothing in progress
    #[default]
    Disconnected,
    /// A connection attempt is running
    Connecting,
    /// Connection established and verified with a keepalive
    Connected,
    /// A termination signal was received; terminal
    ShuttingDown,
}

impl ConnectionState {
    /// Compute the state reached by moving to `to`
    ///
    /// Allowed transitions:
    /// - Disconnected -> Connecting
    /// - Connecting -> Connected
    /// - Connecting | Connected -> Disconnected
    /// - any state except ShuttingDown -> ShuttingDown
    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState> {
        use ConnectionState::*;

        let allowed = matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected | Connecting | Connected, ShuttingDown)
        );

        if allowed {
            Ok(to)
        } else {
            Err(KeeperError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ConnectionState::ShuttingDown)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Presence availability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    /// Online and ready
    Available,
    /// Going offline / leaving
    Unavailable,
}

/// Presence to broadcast to the server or to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// Recipient; `None` means the server (broadcast to roster)
    pub to: Option<PeerId>,
    /// Human-readable status line
    pub status: String,
    /// Availability
    pub kind: PresenceKind,
}

impl Presence {
    /// Status line sent once a connection or a room is ready
    pub const READY_STATUS: &'static str = "Ready to chat";

    /// Status line sent on shutdown
    pub const OFFLINE_STATUS: &'static str = "Offline";

    /// Initial presence to the server
    pub fn ready() -> Self {
        Self {
            to: None,
            status: Self::READY_STATUS.to_string(),
            kind: PresenceKind::Available,
        }
    }

    /// Presence announcing readiness inside a room
    pub fn ready_in(room: PeerId) -> Self {
        Self {
            to: Some(room),
            status: Self::READY_STATUS.to_string(),
            kind: PresenceKind::Available,
        }
    }

    /// Presence announcing that we go offline in a room
    pub fn offline_in(room: PeerId) -> Self {
        Self {
            to: Some(room),
            status: Self::OFFLINE_STATUS.to_string(),
            kind: PresenceKind::Unavailable,
        }
    }
}

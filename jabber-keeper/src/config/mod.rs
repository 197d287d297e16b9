//! Configuration for a SessionKeeper
//!
//! [`SessionConfig`] is what the core reads at runtime. [`AppConfig`] is the
//! whole config file, including logging settings only the bootstrap uses.
//! See [`file`] for how config files are located and parsed.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{KeeperError, Result};
use crate::types::PeerId;

pub use file::{candidate_locations, load, load_from_path, parse_str, MAX_CONFIG_SIZE};

/// Default plaintext / STARTTLS port
pub const DEFAULT_PORT: u16 = 5222;

/// Default port for legacy direct-TLS connections
pub const DEFAULT_SSL_PORT: u16 = 5223;

/// Fallbacks for tunables that are absent (or zero) in the config file, in seconds
pub mod defaults {
    /// Connect / handshake timeout
    pub const CONNECTION_TIMEOUT: u64 = 10;
    /// Delay between reconnection attempts
    pub const RECONNECT_DELAY: u64 = 3;
    /// Base interval of the server liveness probe
    pub const SERVER_PING_DELAY: u64 = 60;
    /// Interval of the room liveness probe
    pub const MUC_PING_DELAY: u64 = 900;
    /// Delay before rejoining a room we were removed from
    pub const MUC_REJOIN_DELAY: u64 = 3;
    /// Upper bound of the random jitter added to probes
    pub const PING_SPLAY_DELAY: u64 = 3;
    /// Log level when none is configured
    pub const LOGLEVEL: &str = "info";
}

/// Runtime configuration of the session core
///
/// Immutable once loaded; cloned into every task that needs it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server host name (also the JID capability discovery is sent to)
    pub server: String,

    /// Server port
    pub port: u16,

    /// Use TLS
    pub ssl: bool,

    /// Upgrade the plaintext connection with STARTTLS
    pub starttls: bool,

    /// Verify the server certificate
    pub ssl_verify: bool,

    /// Allow authentication over an unencrypted connection
    pub insecure_allow_unencrypted_auth: bool,

    /// Account JID used to log in
    pub user: String,

    /// Account password (no authentication when absent)
    pub password: Option<String>,

    /// Nickname used in rooms
    pub nick: String,

    /// Resource part of our own JID
    pub resource: Option<String>,

    /// Rooms to join after every (re)connection
    pub rooms: Vec<PeerId>,

    /// Connect / handshake timeout; also bounds join confirmation waits
    pub connection_timeout: Duration,

    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,

    /// Base interval of the server liveness probe
    pub server_ping_delay: Duration,

    /// Interval of the room liveness probe
    pub muc_ping_delay: Duration,

    /// Delay before rejoining a room after involuntary removal
    pub muc_rejoin_delay: Duration,

    /// Upper bound of the random jitter added to probes
    ///
    /// Spreads probes of many bot instances apart so they don't hit the
    /// server in lockstep.
    pub ping_splay_delay: Duration,
}

impl SessionConfig {
    /// Create a configuration with default tunables
    pub fn new(server: impl Into<String>, nick: impl Into<String>) -> Self {
        let server = server.into();
        let nick = nick.into();

        Self {
            user: format!("{}@{}", nick, server),
            server,
            port: DEFAULT_PORT,
            ssl: false,
            starttls: false,
            ssl_verify: false,
            insecure_allow_unencrypted_auth: false,
            password: None,
            nick,
            resource: None,
            rooms: Vec::new(),
            connection_timeout: Duration::from_secs(defaults::CONNECTION_TIMEOUT),
            reconnect_delay: Duration::from_secs(defaults::RECONNECT_DELAY),
            server_ping_delay: Duration::from_secs(defaults::SERVER_PING_DELAY),
            muc_ping_delay: Duration::from_secs(defaults::MUC_PING_DELAY),
            muc_rejoin_delay: Duration::from_secs(defaults::MUC_REJOIN_DELAY),
            ping_splay_delay: Duration::from_secs(defaults::PING_SPLAY_DELAY),
        }
    }

    /// Set the rooms to join
    pub fn with_rooms(mut self, rooms: Vec<PeerId>) -> Self {
        self.rooms = rooms;
        self
    }

    /// Set the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the server ping interval
    pub fn with_server_ping_delay(mut self, delay: Duration) -> Self {
        self.server_ping_delay = delay;
        self
    }

    /// Set the room ping interval
    pub fn with_muc_ping_delay(mut self, delay: Duration) -> Self {
        self.muc_ping_delay = delay;
        self
    }

    /// Set the room rejoin delay
    pub fn with_muc_rejoin_delay(mut self, delay: Duration) -> Self {
        self.muc_rejoin_delay = delay;
        self
    }

    /// Set the ping jitter bound
    pub fn with_ping_splay_delay(mut self, delay: Duration) -> Self {
        self.ping_splay_delay = delay;
        self
    }

    /// JID of the server, target of server disco#info and c2s pings
    pub fn server_jid(&self) -> Result<PeerId> {
        PeerId::parse(self.server.as_str())
    }

    /// Idle time below which no probe is sent
    pub fn idle_threshold(&self) -> Duration {
        self.server_ping_delay + self.ping_splay_delay
    }

    /// Window after which an unanswered c2s ping counts as lost
    pub fn pong_timeout(&self) -> Duration {
        self.server_ping_delay + self.connection_timeout + self.ping_splay_delay
    }

    /// Check the invariants the core relies on
    pub fn validate(&self) -> Result<()> {
        if self.nick.is_empty() {
            return Err(KeeperError::Config(
                "Jabber nick is not defined in config".to_string(),
            ));
        }

        if self.rooms.is_empty() {
            return Err(KeeperError::Config(
                "No jabber channels/rooms defined in config".to_string(),
            ));
        }

        self.server_jid()
            .map_err(|e| KeeperError::Config(format!("Invalid jabber server: {}", e)))?;

        Ok(())
    }
}

/// Everything a config file holds
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Session settings
    pub jabber: SessionConfig,
    /// Log level filter, e.g. "info" or "debug"
    pub loglevel: String,
    /// Optional log file; stderr when absent
    pub log: Option<PathBuf>,
}

/// Config file as written on disk, before defaults are applied
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawConfig {
    pub jabber: RawJabber,
    pub loglevel: String,
    pub log: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawJabber {
    pub server: String,
    pub port: u16,
    pub ssl: bool,
    pub starttls: bool,
    pub ssl_verify: bool,
    pub insecure_allow_unencrypted_auth: bool,
    pub user: String,
    pub password: String,
    pub nick: String,
    pub resource: String,
    pub channels: Vec<String>,
    pub connection_timeout: u64,
    pub reconnect_delay: u64,
    pub server_ping_delay: u64,
    pub muc_ping_delay: u64,
    pub muc_rejoin_delay: u64,
    pub ping_splay_delay: u64,
}

fn seconds_or(value: u64, fallback: u64) -> Duration {
    Duration::from_secs(if value == 0 { fallback } else { value })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl RawConfig {
    /// Apply defaults and validate
    pub(crate) fn resolve(self) -> Result<AppConfig> {
        let raw = self.jabber;

        if raw.nick.is_empty() {
            return Err(KeeperError::Config(
                "Jabber nick is not defined in config".to_string(),
            ));
        }

        if raw.channels.is_empty() {
            return Err(KeeperError::Config(
                "No jabber channels/rooms defined in config".to_string(),
            ));
        }

        let server = if raw.server.is_empty() {
            tracing::warn!("Jabber server is not defined in config, using localhost");
            "localhost".to_string()
        } else {
            raw.server
        };

        let port = if raw.port == 0 {
            let port = if raw.ssl && !raw.starttls {
                DEFAULT_SSL_PORT
            } else {
                DEFAULT_PORT
            };
            tracing::info!("Jabber port is not defined in config, using {}", port);
            port
        } else {
            raw.port
        };

        let starttls = raw.ssl && raw.starttls;
        let ssl_verify = raw.ssl && starttls && raw.ssl_verify;

        let user = if raw.user.is_empty() {
            format!("{}@{}", raw.nick, server)
        } else {
            raw.user
        };

        let rooms = raw
            .channels
            .into_iter()
            .map(|room| {
                PeerId::parse(room.as_str()).map_err(|e| {
                    KeeperError::Config(format!("Invalid room '{}': {}", room, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let jabber = SessionConfig {
            server,
            port,
            ssl: raw.ssl,
            starttls,
            ssl_verify,
            insecure_allow_unencrypted_auth: raw.insecure_allow_unencrypted_auth,
            user,
            password: non_empty(raw.password),
            nick: raw.nick,
            resource: non_empty(raw.resource),
            rooms,
            connection_timeout: seconds_or(raw.connection_timeout, defaults::CONNECTION_TIMEOUT),
            reconnect_delay: seconds_or(raw.reconnect_delay, defaults::RECONNECT_DELAY),
            server_ping_delay: seconds_or(raw.server_ping_delay, defaults::SERVER_PING_DELAY),
            muc_ping_delay: seconds_or(raw.muc_ping_delay, defaults::MUC_PING_DELAY),
            muc_rejoin_delay: seconds_or(raw.muc_rejoin_delay, defaults::MUC_REJOIN_DELAY),
            ping_splay_delay: seconds_or(raw.ping_splay_delay, defaults::PING_SPLAY_DELAY),
        };
        jabber.validate()?;

        let loglevel = non_empty(self.loglevel).unwrap_or_else(|| defaults::LOGLEVEL.to_string());

        Ok(AppConfig {
            jabber,
            loglevel,
            log: non_empty(self.log).map(PathBuf::from),
        })
    }
}

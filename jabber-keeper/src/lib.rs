//! # jabber-keeper
//!
//! Connection-lifecycle and liveness core for an XMPP bot that has to stay
//! online in a set of multi-user chat rooms.
//!
//! ## Overview
//!
//! The `jabber-keeper` library keeps one logical session to a server alive:
//! it (re)establishes the connection, joins the configured rooms, watches the
//! server and the rooms for silence, and leaves politely on shutdown. Stanza
//! encoding, TLS and authentication stay behind the [`Transport`] trait; the
//! replies a transport receives are fed back through
//! [`SessionHandle::deliver`].
//!
//! ## Key Features
//!
//! - Single-flight reconnection with a fixed delay, retried forever
//! - Capability discovery cached per server and room
//! - Room joins with bounded confirmation waits; password rooms are skipped
//! - Server probing with c2s ping or whitespace keepalive, stall detection
//! - Room self-ping for rooms advertising the optimisation
//! - Offline presence broadcast on SIGINT/SIGTERM/SIGQUIT
//!
//! ## Example
//!
//! ```rust,no_run
//! use jabber_keeper::{config, SessionKeeper, Transport};
//!
//! async fn keep(transport: impl Transport) -> jabber_keeper::Result<()> {
//!     // Search the usual locations for a config file
//!     let app = config::load(None)?;
//!
//!     let keeper = SessionKeeper::new(app.jabber, transport)?;
//!     let router = keeper.handle();
//!     // hand `router` to whatever parses incoming stanzas
//!     # drop(router);
//!
//!     keeper.run().await?;
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod config;
pub mod error;
pub mod network;
pub mod session;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{AppConfig, SessionConfig};
pub use error::{KeeperError, Result};
pub use network::{Connection, Transport};
pub use session::{
    InboundEvent, JoinOutcome, Link, ServerProbe, SessionHandle, SessionKeeper, SessionStatus,
    ShutdownCoordinator, ShutdownReport, Signal,
};
pub use state::SharedState;
pub use types::{features, ConnectionState, FeatureSet, PeerId, Presence, PresenceKind, SessionId};

//! Transport abstraction consumed by the session core
//!
//! Implementations own the wire: stream setup, TLS/SASL, stanza encoding.
//! Responses to discovery, joins and pings are not returned from these calls;
//! they arrive later through the stanza router as
//! [`InboundEvent`](crate::session::InboundEvent)s.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{PeerId, Presence};

/// Factory of connections to the configured server
pub trait Transport: Send + Sync + 'static {
    /// Open and authenticate a new connection
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>>;
}

/// One live connection to the server
///
/// Every method maps to a single outgoing stanza (or whitespace ping for
/// [`keepalive`](Connection::keepalive)). An `Err` means the connection is
/// no longer usable.
pub trait Connection: Send + Sync + 'static {
    /// Our own full JID on this connection
    fn identity(&self) -> &PeerId;

    /// Transport-level keepalive (whitespace ping)
    fn keepalive(&self) -> BoxFuture<'_, Result<()>>;

    /// Send a presence stanza
    fn send_presence(&self, presence: Presence) -> BoxFuture<'_, Result<()>>;

    /// Send a disco#info request from our identity to `target`
    fn discover_info<'a>(&'a self, target: &'a PeerId) -> BoxFuture<'a, Result<()>>;

    /// Enter `room` as `nickname`, requesting no history
    fn join_room<'a>(&'a self, room: &'a PeerId, nickname: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Send an XEP-0199 ping from our identity to `target`
    fn ping_peer<'a>(&'a self, target: &'a PeerId) -> BoxFuture<'a, Result<()>>;

    /// Close the stream
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

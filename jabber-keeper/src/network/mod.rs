//! Network layer for jabber-keeper
//!
//! The core never touches sockets or stanzas itself; it drives a
//! [`Transport`] and the [`Connection`]s it hands out.

pub mod transport;

pub use transport::{Connection, Transport};

/// Error types for the jabber-keeper library
use thiserror::Error;

/// Result type alias for keeper operations
pub type Result<T> = std::result::Result<T, KeeperError>;

/// Errors that can occur in jabber-keeper operations
#[derive(Debug, Error)]
pub enum KeeperError {
    /// Configuration is missing, unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure (connect, send, ping, close)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid peer identifier provided
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Invalid connection state transition attempted
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Attempted target state
        to: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file syntax error
    #[error("Hjson error: {0}")]
    Hjson(#[from] deser_hjson::Error),
}

impl KeeperError {
    /// Shorthand for building a transport error from anything printable
    pub fn transport(reason: impl std::fmt::Display) -> Self {
        KeeperError::Transport(reason.to_string())
    }
}

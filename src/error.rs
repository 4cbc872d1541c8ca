use std::io;

use thiserror::Error;

/// Failure taxonomy shared by the channel, dispatcher, run driver and relay.
///
/// Only `Transport` ends a dispatcher loop or a relay connection. Every other
/// kind is turned into an error reply and the connection stays up.
#[derive(Debug, Error)]
pub enum RtError {
    /// The channel is broken: connection closed, write failed, reply id mismatch.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A message could not be parsed or is missing a required field.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Business-rule failure reported by a model or by the core itself.
    #[error("{0}")]
    Domain(String),

    /// A relay path or extension check failed. No filesystem access was made.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A cooperative stop was requested while a run was in progress.
    #[error("run cancelled")]
    Cancelled,

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl RtError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain(message.into())
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied(message.into())
    }

    /// Build a transport error from a description, for failures that did not
    /// originate in an io call (e.g. a mismatched reply id).
    pub fn broken_channel(message: impl Into<String>) -> Self {
        Self::Transport(io::Error::new(io::ErrorKind::InvalidData, message.into()))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T, E = RtError> = std::result::Result<T, E>;

//! Error taxonomy of the connection manager.

use crate::p2p::ChannelError;
use thiserror::Error;

/// Boxed error type used to surface upstream failures verbatim.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by the connection manager's public API and by the
/// injected seams it calls.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect was called while a session already exists.
    #[error("connection already exists")]
    AlreadyExists,

    /// Disconnect was called while no session exists.
    #[error("no connection exists")]
    NoConnection,

    /// An in-flight connect was aborted by disconnect.
    #[error("connection was cancelled")]
    Cancelled,

    /// The tunnel exited before reaching connected, or the control channel
    /// was declared lost.
    #[error("connection failed")]
    Failed,

    /// Control-channel failure.
    #[error("p2p channel: {0}")]
    Channel(#[from] ChannelError),

    /// Any other upstream failure, surfaced verbatim.
    #[error("{0}")]
    Other(BoxedError),
}

impl Error {
    /// Wrap a plain message as an upstream error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_surface_verbatim() {
        let err = Error::other("fatal connection error");
        assert_eq!(err.to_string(), "fatal connection error");
    }

    #[test]
    fn channel_errors_convert() {
        let err: Error = ChannelError::Closed.into();
        assert!(matches!(err, Error::Channel(ChannelError::Closed)));
    }
}

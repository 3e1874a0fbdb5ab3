//! Error types for skerry-hyperstart.

use thiserror::Error;

/// Result type alias for guest agent calls.
pub type Result<T> = std::result::Result<T, HyperstartError>;

/// Errors returned by a [`Hyperstart`](crate::Hyperstart) call.
///
/// There is no timeout variant: a call either completes, is rejected by
/// the guest, or loses its channel.
#[derive(Debug, Error)]
pub enum HyperstartError {
    /// The guest agent rejected the request
    #[error("agent error {code}: {message}")]
    Agent {
        /// Error code reported by the guest
        code: i32,
        /// Error message reported by the guest
        message: String,
    },

    /// The channel to the guest is unavailable, closed or carried garbage
    #[error("transport error: {0}")]
    Transport(String),

    /// The guest is paused; only pause, unpause and close are allowed
    #[error("guest is paused")]
    Paused,

    /// The client was closed by its owner
    #[error("client closed")]
    Closed,
}

impl HyperstartError {
    pub(crate) fn agent(code: i32, message: impl Into<String>) -> Self {
        Self::Agent {
            code,
            message: message.into(),
        }
    }

    /// True if the guest itself rejected the request.
    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }

    /// True if the channel failed rather than the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<std::io::Error> for HyperstartError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(format!("I/O error: {e}"))
    }
}

impl From<serde_json::Error> for HyperstartError {
    fn from(e: serde_json::Error) -> Self {
        Self::Transport(format!("malformed frame: {e}"))
    }
}

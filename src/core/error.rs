//! Error types for RUC protocol.

use thiserror::Error;

/// Errors returned by the application-facing connection API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connection is not in the established state.
    #[error("connection not established")]
    NotEstablished,

    /// Empty messages are not sent.
    #[error("empty message")]
    EmptyMessage,

    /// Message would need more fragments than a sequence space can carry.
    #[error("message too large: {fragments} fragments, at most {max} allowed")]
    MessageTooLarge {
        /// Fragments the message would need.
        fragments: usize,
        /// Maximum fragments per message.
        max: usize,
    },

    /// Connection has been closed.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Check if the connection is gone after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Closed)
    }
}

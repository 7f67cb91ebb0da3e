use thiserror::Error;

use crate::connection::ConnectionState;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The service rejected the bearer token. Always ends the session.
    #[error("authorization rejected by service during {operation}")]
    Auth { operation: &'static str },
    #[error("{operation} failed: {message}")]
    TransientFetch {
        operation: &'static str,
        message: String,
    },
    #[error("channel error: {0}")]
    Channel(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no peer selected")]
    NoPeerSelected,
    #[error("invalid connection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("session persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl ClientError {
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            operation,
            message: message.into(),
        }
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

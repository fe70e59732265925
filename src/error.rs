//! Error types for the messaging client
//!
//! Every fault the client reports carries an [`ErrorKind`] so callers can
//! branch on it programmatically instead of parsing message text.

use crate::client::ClientState;
use crate::transport::{MessengerError, MessengerErrorKind};
use thiserror::Error;

/// Programmatic classification of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad pattern, share, option or argument shape
    Validation,
    /// Transport-level connectivity fault
    Network,
    /// TLS trust or identity verification failure
    Security,
    /// Operation attempted while the client is in the wrong state
    State,
}

/// Main error type for client operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Invalid argument: {message}")]
    Validation { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Security error: {message}")]
    Security { message: String },

    #[error("Cannot {operation} while client is {state}")]
    State {
        operation: &'static str,
        state: ClientState,
    },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Validation { .. } => ErrorKind::Validation,
            ClientError::Network { .. } => ErrorKind::Network,
            ClientError::Security { .. } => ErrorKind::Security,
            ClientError::State { .. } => ErrorKind::State,
        }
    }

    /// Create validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create security error
    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Create state error
    pub fn state(operation: &'static str, state: ClientState) -> Self {
        Self::State { operation, state }
    }

    /// Map a fault raised by the messenger during connect
    ///
    /// Connect is the one place where the messenger validates its inputs, so
    /// an invalid argument surfaces as a validation error here.
    pub fn from_connect_failure(error: MessengerError) -> Self {
        match error.kind {
            MessengerErrorKind::Security => Self::security(error.message),
            MessengerErrorKind::InvalidArgument => Self::validation(error.message),
            MessengerErrorKind::Network | MessengerErrorKind::Other => {
                Self::network(error.message)
            }
        }
    }
}

/// Faults observed while polling are connection faults unless the
/// messenger says the peer failed TLS verification.
impl From<MessengerError> for ClientError {
    fn from(error: MessengerError) -> Self {
        match error.kind {
            MessengerErrorKind::Security => Self::security(error.message),
            _ => Self::network(error.message),
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

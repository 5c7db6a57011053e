// ABOUTME: Client error types covering connection, handshake and protocol failures
// ABOUTME: Provides structured error reporting with automatic conversion from underlying I/O errors

use std::io;
use thiserror::Error;

/// Error type for client operations.
///
/// Local problems (a missing source file, an unwritable destination) are
/// not errors at this level; they are reported to the user and the client
/// carries on. Everything here ends the session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error during network operations (connect, read, write)
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The broker spoke something other than the expected id handshake
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Connection closed unexpectedly
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// Frame-level failure on an established connection
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

impl From<crate::Error> for ClientError {
    fn from(err: crate::Error) -> Self {
        match err.downcast::<io::Error>() {
            Ok(io_err) => ClientError::Connection(*io_err),
            Err(other) => ClientError::Protocol(other.to_string()),
        }
    }
}

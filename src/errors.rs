use std::sync::Arc;

use thiserror::Error;

use crate::frame::frame_errors::FrameError;

/// Error that occurred while establishing a connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The TCP connect did not finish within the configured connect timeout.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// The STARTUP exchange did not end with a READY response.
    #[error("Startup handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The configured keyspace could not be bound after the handshake.
    #[error("Binding keyspace failed: {0}")]
    Keyspace(#[from] KeyspaceError),

    /// Input/Output error has occurred, connection refused etc.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HandshakeError {
    /// Database rejected the STARTUP request.
    #[error("Database returned an error: code {code}, message: {message}")]
    Db { code: i32, message: String },

    /// Got a well-formed response to STARTUP, but not READY or ERROR.
    #[error("Unexpected response to STARTUP")]
    UnexpectedResponse,

    /// No whole response frame arrived in time.
    #[error("Timed out waiting for the STARTUP response")]
    Timeout,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KeyspaceError {
    /// Database rejected the `USE` query.
    #[error("Database returned an error: code {code}, message: {message}")]
    Db { code: i32, message: String },

    /// Server confirmed a different keyspace than the one requested.
    #[error("Server bound keyspace {actual:?} instead of {requested:?}")]
    Mismatch { requested: String, actual: String },

    /// Got a well-formed response to `USE`, but not SET_KEYSPACE or ERROR.
    #[error("Unexpected response to USE")]
    UnexpectedResponse,

    /// No whole response frame arrived in time.
    #[error("Timed out waiting for the USE response")]
    Timeout,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Error delivered to a single request's waiter.
///
/// `Clone`, because one broken socket fans the same error out to every
/// pending waiter.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Database sent an ERROR response correlated to this request.
    #[error("Database returned an error: code {code}, message: {message}")]
    Db { code: i32, message: String },

    /// The socket dropped or the connection was stopped while the request
    /// was in flight.
    #[error("Connection closed")]
    Closed,

    /// The connection had no socket when the request was submitted.
    #[error("Connection is not ready for requests")]
    NotConnected,

    /// The request could not be encoded, or no stream id could be assigned
    /// to it.
    #[error("Invalid request")]
    Invalid,

    /// The request was not handed to the peer in time, or the caller gave up
    /// waiting for the response.
    #[error("Timeout Error")]
    Timeout,

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),
}

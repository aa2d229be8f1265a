//! Error definitions for the client.
//!
//! One crate-level enum covers configuration, connect, timeout, protocol,
//! server-reported, pool, sink and cancellation failures. Server status
//! codes are errno values carried back in the response header.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Base error type for all client failures.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration, rejected at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TCP connect failed or was refused.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A read, write or connect deadline was exceeded.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// Malformed frame, length mismatch or codec failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with a nonzero status code.
    #[error("server error (status {status}): {}", status_message(*.status))]
    Server { status: u8 },

    /// All connections were in use and none freed up within the acquire
    /// deadline.
    #[error("connection pool for {0} exhausted")]
    PoolExhausted(String),

    /// The download sink rejected a write.
    #[error("download sink failed: {0}")]
    Stream(String),

    /// The operation was cancelled mid-flight.
    #[error("operation cancelled")]
    Cancelled,

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    /// A file id did not have the `group/path` form.
    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    /// An argument was rejected before anything hit the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport-level I/O failure mid-exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The numeric status for a server-reported error, if that is what this is.
    pub fn server_status(&self) -> Option<u8> {
        match self {
            ClientError::Server { status } => Some(*status),
            _ => None,
        }
    }
}

/// Human-readable text for the errno-style status codes FastDFS servers
/// return in the response header.
pub fn status_message(status: u8) -> &'static str {
    match status {
        2 => "no such file",
        13 => "permission denied",
        17 => "file already exists",
        22 => "invalid argument",
        28 => "no space left on storage",
        _ => "server error",
    }
}

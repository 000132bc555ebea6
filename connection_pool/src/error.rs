use pool_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

/// An error that might occur on a single pooled connection.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("I/O Error: {0}")]
    IoError(String),
    #[error("TLS Error: {0}")]
    TlsError(String),
    #[error("Connection timed out")]
    Timeout,
    #[error("Send queue full")]
    SendQueueFull,
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl<T> From<TrySendError<T>> for ConnectionError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => Self::SendQueueFull,
            TrySendError::Closed(_) => Self::Closed,
        }
    }
}

/// An error raised while decoding a command read off a stream.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Unrecognised command type: {0}")]
    UnknownType(String),
    #[error("Malformed {0} payload: {1}")]
    Malformed(&'static str, #[source] serde_json::Error),
}

/// An error surfaced to users of the pool client.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Connection attempt failed: {0}")]
    ConnectFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Timed out waiting for the pool to answer")]
    CreationTimeout,
    #[error("Pool protocol version {0} is newer than supported version {1}")]
    IncompatiblePool(u32, u32),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

//! Error type definitions

use thiserror::Error;

/// Errors surfaced by the dataplane engines and the control-plane client.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid MTU, port layout, or flag combination. Detected at open time
    /// and fatal to the component being constructed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or truncated wire data. Recoverable: the fragment is
    /// dropped and counted, the receive loop continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or OS-level failure on send, receive, bind, or file access.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Control-plane request failed below the HTTP status level.
    #[error("control plane unreachable: {0}")]
    Network(String),

    /// Wrong or missing token scope, or an expired/unknown reservation.
    /// Never retried automatically.
    #[error("authorization error: {0}")]
    Auth(String),

    /// Unknown reservation or worker id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A bounded queue was full on enqueue. The caller decides whether to
    /// retry.
    #[error("bounded queue full")]
    Backpressure,

    /// A deadline elapsed. Event-assembly timeouts are reported through the
    /// lost-event queue instead, never through this variant.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation on an engine or context that was already released.
    #[error("handle already closed")]
    Closed,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

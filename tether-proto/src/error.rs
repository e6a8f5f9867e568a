//! Error types for the wire protocol.

use std::io;

/// Alias for `Result<T, tether_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by sessions and streams.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The underlying connection is gone; every stream on it fails.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer closed this stream before sending the expected event.
    #[error("stream closed by peer")]
    StreamClosed,

    /// The payload was not valid JSON or did not match the event shape.
    #[error("malformed event: {0}")]
    Decode(#[from] serde_json::Error),

    /// The payload carried no `kind` string.
    #[error("event has no kind discriminant")]
    MissingKind,

    /// The payload carried a `kind` outside the closed event set.
    #[error("unknown event kind {0:?}")]
    UnknownKind(String),

    /// A well-formed event arrived where a different one was expected.
    #[error("expected {expected}, got {got}")]
    Unexpected {
        /// Kind the caller was waiting for.
        expected: &'static str,
        /// Kind that actually arrived.
        got: &'static str,
    },

    /// I/O error on the underlying transport.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            closed @ Error::ConnectionClosed => Self::new(io::ErrorKind::ConnectionAborted, closed),
            closed @ Error::StreamClosed => Self::new(io::ErrorKind::UnexpectedEof, closed),
            other => Self::new(io::ErrorKind::InvalidData, other),
        }
    }
}

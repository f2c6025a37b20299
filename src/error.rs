use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The command could not be serialised; nothing was sent.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The server (or local argument validation) rejected the command.
    /// The connection stays usable.
    #[error("{0}")]
    Request(String),

    /// Transport failure: connect refused, socket reset, malformed reply bytes.
    #[error("connection error: {0}")]
    Connection(String),

    /// The client was closed before or while the request was in flight.
    #[error("closing error: {0}")]
    Closing(String),

    #[error("timed out waiting for a reply")]
    Timeout,

    /// The server answered, but not with the shape the typed method expects.
    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },
}

impl Error {
    pub fn request(msg: impl Into<String>) -> Self {
        Error::Request(msg.into())
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Error::Request(_))
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Error::Closing(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

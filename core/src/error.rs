//! Error taxonomy for connections, handles and streams.
//!
//! # Design
//! Every failure the core can surface is a variant of [`Error`], so callers
//! can tell caller-side cancellation (`Interrupted`) apart from an engine
//! deadline (`Timeout`) and from a plain transport failure. Streams speak
//! `std::io`, so `Error` converts into `io::Error` with the original value
//! kept as the inner error; [`Error::from_io`] gets it back.

use std::fmt;
use std::io;

/// Which engine deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Read,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => f.write_str("connect"),
            TimeoutKind::Read => f.write_str("read"),
        }
    }
}

/// Errors returned by connections, transfer handles and their streams.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller broke an ordering rule, e.g. mutating configuration after
    /// `connect()` or reading headers before it.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The request shape does not allow the operation (input disabled,
    /// output disabled, declared body length not honoured).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed url: {0}")]
    MalformedUrl(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// DNS lookup failed.
    #[error("unable to resolve host: {0}")]
    Resolution(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection reset, mid-transfer disconnect, too many redirects and
    /// other socket-level failures.
    #[error("transport failure: {0}")]
    Transport(String),

    /// TLS handshake or certificate failure.
    #[error("security failure: {0}")]
    Security(String),

    #[error("{0} timeout reached")]
    Timeout(TimeoutKind),

    /// The calling thread was interrupted. `transferred` counts the bytes
    /// moved by the aborted call before the interruption was observed.
    #[error("interrupted after transferring {transferred} bytes")]
    Interrupted { transferred: usize },

    /// The server demanded re-authentication or the connection broke after
    /// a streamed body was partially sent; a new request is required.
    #[error("request can not be retried automatically (status {status}), retry manually")]
    RetryImpossible { status: u16 },

    #[error("out of memory")]
    ResourceExhausted,

    /// Two threads entered the same transfer handle at once.
    #[error("transfer handle is in use by another thread")]
    ConcurrentUse,

    #[error("already closed")]
    Closed,

    /// `input_stream()` was requested for an error response; use
    /// `error_stream()` instead.
    #[error("server returned HTTP response code {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// The engine does not know the resource id (already disposed).
    #[error("unknown transfer resource")]
    UnknownResource,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Recover the `Error` wrapped inside an `io::Error` produced by a stream.
    pub fn from_io(err: &io::Error) -> Option<&Error> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Timeout(_) => io::ErrorKind::TimedOut,
            Error::ConnectionRefused(_) => io::ErrorKind::ConnectionRefused,
            Error::MalformedUrl(_) => io::ErrorKind::InvalidInput,
            Error::ResourceExhausted => io::ErrorKind::OutOfMemory,
            // Not `Interrupted`: std's read/write helpers retry that kind.
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

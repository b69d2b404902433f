//! Error types for the uploader.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Top-level error, only surfaced to `main` for startup failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot open bets file {path}: {source}")]
    BetsFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot initialize logging: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the transport session.
///
/// `ReadLine` callers need to tell three outcomes apart: a line, a deadline
/// expiry ([`SessionError::DeadlineExceeded`]) and everything else.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("no line within {0:?}")]
    DeadlineExceeded(Duration),

    /// The session was closed locally, or never held a connection.
    #[error("connection closed")]
    Closed,

    /// The peer closed its side before a full line arrived.
    #[error("connection closed by peer")]
    PeerClosed,
}

impl SessionError {
    pub fn is_deadline(&self) -> bool {
        matches!(self, SessionError::DeadlineExceeded(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// An input line that could not become a [`Bet`](crate::types::Bet).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bet in line {line} had invalid parameters: {reason}")]
pub struct RecordError {
    pub line: usize,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("expected at least 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid name")]
    Name,
    #[error("invalid date of birth")]
    DateOfBirth,
    #[error("invalid id number")]
    IdNumber,
    #[error("invalid chosen number")]
    Number,
    #[error("line is not valid UTF-8")]
    Encoding,
}

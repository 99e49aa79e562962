use std::io;

use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP transaction handling
#[derive(Error, Debug)]
pub enum Error {
    /// RSeq outside `[MIN_RSEQ, MAX_RSEQ]`
    #[error("RSeq {0} out of range")]
    RSeqOutOfRange(u64),

    /// The starting RSeq can only be chosen once, before the first reliable provisional
    #[error("RSeq already set or in use")]
    RSeqAlreadySet,

    /// Invalid transaction state transition attempted.
    #[error("Invalid transaction state transition: {0}")]
    InvalidStateTransition(String),

    /// Error originating from the transport crate.
    #[error("SIP transport error: {0}")]
    TransportError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other miscellaneous errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl From<sipconn_transport::Error> for Error {
    fn from(e: sipconn_transport::Error) -> Self {
        Error::TransportError(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

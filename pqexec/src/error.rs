//! Error types for pqexec

use thiserror::Error;

use crate::driver::ExecStatus;

/// Result type alias for pqexec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during database operations.
///
/// Every public operation returns one of these as a value; nothing is
/// raised across the crate boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Field index past the end of a row
    #[error("Field index out of range")]
    FieldOutOfRange,

    /// Tuple index past the end of a result
    #[error("Tuple index out of range")]
    TupleOutOfRange,

    /// The connection could not be established or was lost
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// The server answered with a status the caller did not ask for
    #[error("Unexpected status {got} for query {query:?}, expected one of {expected:?}")]
    UnexpectedStatus {
        got: ExecStatus,
        query: String,
        expected: Vec<ExecStatus>,
    },

    /// Cancelling an in-flight request failed
    #[error("Cancel failure: {0}")]
    CancelFailure(String),

    /// The server reported an error for the statement
    #[error("Result error: {0}")]
    ResultError(String),

    /// Another operation already owns the connection
    #[error("Connection busy: another query is in flight on this connection")]
    Busy,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

//! Native client seam.
//!
//! pqexec never talks to the network itself. A [`Driver`] opens blocking
//! [`NativeClient`] handles, and the executor drives them through the
//! non-blocking send / consume / busy / get-result cycle.

#[cfg(feature = "libpq")]
pub mod libpq;
#[cfg(any(test, feature = "memory"))]
pub mod memory;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Status of a single native result object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    CopyOut,
    CopyIn,
    BadResponse,
    NonfatalError,
    FatalError,
    CopyBoth,
    SingleTuple,
}

impl ExecStatus {
    /// Whether the status reports a server or protocol error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ExecStatus::BadResponse | ExecStatus::NonfatalError | ExecStatus::FatalError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::EmptyQuery => "PGRES_EMPTY_QUERY",
            ExecStatus::CommandOk => "PGRES_COMMAND_OK",
            ExecStatus::TuplesOk => "PGRES_TUPLES_OK",
            ExecStatus::CopyOut => "PGRES_COPY_OUT",
            ExecStatus::CopyIn => "PGRES_COPY_IN",
            ExecStatus::BadResponse => "PGRES_BAD_RESPONSE",
            ExecStatus::NonfatalError => "PGRES_NONFATAL_ERROR",
            ExecStatus::FatalError => "PGRES_FATAL_ERROR",
            ExecStatus::CopyBoth => "PGRES_COPY_BOTH",
            ExecStatus::SingleTuple => "PGRES_SINGLE_TUPLE",
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a native client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("field {field} out of range (result has {nfields} fields)")]
    FieldOutOfRange { field: usize, nfields: usize },

    #[error("tuple {tuple} out of range (result has {ntuples} tuples)")]
    TupleOutOfRange { tuple: usize, ntuples: usize },

    #[error("{0}")]
    ConnectionFailure(String),

    #[error("{0}")]
    Cancel(String),

    /// Protocol misuse or any other library-level failure
    #[error("{0}")]
    Library(String),
}

/// Opens native client handles. Calls are blocking.
pub trait Driver: Send + Sync + 'static {
    /// Connect using an opaque connection string, passed through verbatim.
    fn connect(&self, conninfo: &str) -> Result<Box<dyn NativeClient>, NativeError>;
}

/// Shared, type-erased driver handle.
pub type SharedDriver = Arc<dyn Driver>;

/// One blocking client handle with an asynchronous query interface.
pub trait NativeClient: Send {
    /// Dispatch a query without waiting for its results.
    fn send_query(&mut self, query: &str, params: &[&str]) -> Result<(), NativeError>;

    /// Push queued outgoing data to the server. `Ok(true)` once nothing is
    /// left to send, `Ok(false)` if the transport would block.
    ///
    /// Clients that write the whole query inside `send_query` keep the
    /// default.
    fn flush(&mut self) -> Result<bool, NativeError> {
        Ok(true)
    }

    /// Read whatever input is pending on the transport.
    fn consume_input(&mut self) -> Result<(), NativeError>;

    /// Whether a call to `get_result` would block.
    fn is_busy(&self) -> bool;

    /// Next buffered result, or `None` once the query is fully drained.
    fn get_result(&mut self) -> Option<Box<dyn NativeResult>>;

    /// Close the handle. Blocking.
    fn finish(self: Box<Self>);
}

/// A single native result object with text accessors.
pub trait NativeResult: Send {
    fn status(&self) -> ExecStatus;

    fn ntuples(&self) -> usize;

    fn nfields(&self) -> usize;

    /// Text value of a field. SQL NULL reads as the empty string.
    fn get_value(&self, tuple: usize, field: usize) -> Result<String, NativeError>;

    /// Error text attached to the result, empty when there is none.
    fn error_message(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_statuses() {
        assert!(ExecStatus::FatalError.is_error());
        assert!(ExecStatus::BadResponse.is_error());
        assert!(!ExecStatus::TuplesOk.is_error());
        assert!(!ExecStatus::EmptyQuery.is_error());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ExecStatus::CommandOk.to_string(), "PGRES_COMMAND_OK");
    }
}

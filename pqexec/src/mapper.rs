//! Conversion of native results and errors into pqexec types

use crate::driver::{ExecStatus, NativeError, NativeResult};
use crate::error::{Error, Result};
use crate::row::Row;

impl From<NativeError> for Error {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::FieldOutOfRange { .. } => Error::FieldOutOfRange,
            NativeError::TupleOutOfRange { .. } => Error::TupleOutOfRange,
            NativeError::ConnectionFailure(msg) => Error::ConnectionFailure(msg),
            NativeError::Cancel(msg) => Error::CancelFailure(msg),
            NativeError::Library(msg) => Error::ResultError(msg),
        }
    }
}

/// Check that a result carries tuples.
///
/// Error statuses surface the server's message; anything else that isn't
/// `TuplesOk` is reported as an unexpected status for `query`.
pub(crate) fn expect_tuples(result: &dyn NativeResult, query: &str) -> Result<()> {
    match result.status() {
        ExecStatus::TuplesOk => Ok(()),
        status if status.is_error() => Err(Error::ResultError(error_text(result))),
        status => Err(Error::UnexpectedStatus {
            got: status,
            query: query.to_string(),
            expected: vec![ExecStatus::TuplesOk],
        }),
    }
}

/// Check the status of a command. `TuplesOk` counts, for RETURNING.
pub(crate) fn expect_command(result: &dyn NativeResult) -> Result<()> {
    match result.status() {
        ExecStatus::CommandOk | ExecStatus::TuplesOk => Ok(()),
        _ => Err(Error::ResultError(error_text(result))),
    }
}

/// Read one tuple.
pub(crate) fn read_row(result: &dyn NativeResult, tuple: usize) -> Result<Row> {
    let ntuples = result.ntuples();
    if tuple >= ntuples {
        return Err(NativeError::TupleOutOfRange { tuple, ntuples }.into());
    }
    (0..result.nfields())
        .map(|field| result.get_value(tuple, field).map_err(Error::from))
        .collect::<Result<Vec<_>>>()
        .map(Row::new)
}

/// Read every tuple.
pub(crate) fn read_rows(result: &dyn NativeResult) -> Result<Vec<Row>> {
    (0..result.ntuples())
        .map(|tuple| read_row(result, tuple))
        .collect()
}

/// Read the first tuple, treating an empty result as "no row".
pub(crate) fn read_first(result: &dyn NativeResult) -> Result<Option<Row>> {
    match read_row(result, 0) {
        Ok(row) => Ok(Some(row)),
        Err(Error::TupleOutOfRange) => Ok(None),
        Err(e) => Err(e),
    }
}

fn error_text(result: &dyn NativeResult) -> String {
    let message = result.error_message();
    let message = message.trim_end();
    if message.is_empty() {
        result.status().to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        status: ExecStatus,
        rows: Vec<Vec<&'static str>>,
        nfields: usize,
        error: &'static str,
    }

    impl NativeResult for Fixed {
        fn status(&self) -> ExecStatus {
            self.status
        }

        fn ntuples(&self) -> usize {
            self.rows.len()
        }

        fn nfields(&self) -> usize {
            self.nfields
        }

        fn get_value(&self, tuple: usize, field: usize) -> std::result::Result<String, NativeError> {
            let row = self.rows.get(tuple).ok_or(NativeError::TupleOutOfRange {
                tuple,
                ntuples: self.rows.len(),
            })?;
            row.get(field)
                .map(|v| v.to_string())
                .ok_or(NativeError::FieldOutOfRange {
                    field,
                    nfields: self.nfields,
                })
        }

        fn error_message(&self) -> String {
            self.error.to_string()
        }
    }

    fn tuples(rows: Vec<Vec<&'static str>>) -> Fixed {
        let nfields = rows.first().map(Vec::len).unwrap_or(2);
        Fixed {
            status: ExecStatus::TuplesOk,
            rows,
            nfields,
            error: "",
        }
    }

    fn status(status: ExecStatus, error: &'static str) -> Fixed {
        Fixed {
            status,
            rows: Vec::new(),
            nfields: 0,
            error,
        }
    }

    #[test]
    fn test_native_error_mapping() {
        assert_eq!(
            Error::from(NativeError::ConnectionFailure("gone".into())),
            Error::ConnectionFailure("gone".into())
        );
        assert_eq!(
            Error::from(NativeError::FieldOutOfRange { field: 3, nfields: 1 }),
            Error::FieldOutOfRange
        );
        assert_eq!(
            Error::from(NativeError::Cancel("nope".into())),
            Error::CancelFailure("nope".into())
        );
        assert_eq!(
            Error::from(NativeError::Library("busy".into())),
            Error::ResultError("busy".into())
        );
    }

    #[test]
    fn test_read_rows() {
        let result = tuples(vec![vec!["1", "a"], vec!["2", "b"]]);
        let rows = read_rows(&result).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], ["2", "b"]);
    }

    #[test]
    fn test_read_first_empty_is_none() {
        let result = tuples(Vec::new());
        assert_eq!(read_first(&result).unwrap(), None);
    }

    #[test]
    fn test_field_error_is_not_downgraded() {
        let mut result = tuples(vec![vec!["1"]]);
        result.nfields = 2;
        assert_eq!(read_first(&result), Err(Error::FieldOutOfRange));
    }

    #[test]
    fn test_expect_tuples() {
        assert!(expect_tuples(&tuples(Vec::new()), "SELECT 1").is_ok());

        let err = expect_tuples(&status(ExecStatus::CommandOk, ""), "CREATE TABLE t ()");
        assert_eq!(
            err,
            Err(Error::UnexpectedStatus {
                got: ExecStatus::CommandOk,
                query: "CREATE TABLE t ()".into(),
                expected: vec![ExecStatus::TuplesOk],
            })
        );

        let err = expect_tuples(&status(ExecStatus::FatalError, "ERROR:  boom\n"), "SELECT");
        assert_eq!(err, Err(Error::ResultError("ERROR:  boom".into())));
    }

    #[test]
    fn test_expect_command() {
        assert!(expect_command(&status(ExecStatus::CommandOk, "")).is_ok());
        assert!(expect_command(&tuples(Vec::new())).is_ok());
        assert_eq!(
            expect_command(&status(ExecStatus::EmptyQuery, "")),
            Err(Error::ResultError("PGRES_EMPTY_QUERY".into()))
        );
    }
}

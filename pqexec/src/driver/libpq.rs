//! Driver backed by the system libpq.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr::{self, NonNull};

use pq_sys::{
    ConnStatusType, ExecStatusType, PGconn, PGresult, PQclear, PQconnectdb, PQconsumeInput,
    PQerrorMessage, PQfinish, PQflush, PQgetResult, PQgetisnull, PQgetvalue, PQisBusy,
    PQnfields, PQntuples, PQresultErrorMessage, PQresultStatus, PQsendQueryParams,
    PQsetnonblocking, PQstatus,
};

use super::{Driver, ExecStatus, NativeClient, NativeError, NativeResult};

/// Opens connections through `PQconnectdb`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibPq;

impl Driver for LibPq {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn NativeClient>, NativeError> {
        let conninfo = CString::new(conninfo)
            .map_err(|_| NativeError::ConnectionFailure("conninfo contains a NUL byte".into()))?;

        // SAFETY: conninfo is a valid NUL-terminated string for the call.
        let raw = unsafe { PQconnectdb(conninfo.as_ptr()) };
        let conn = NonNull::new(raw).ok_or_else(|| {
            NativeError::ConnectionFailure("out of memory allocating connection".into())
        })?;

        // SAFETY: conn is a live handle returned by PQconnectdb.
        let status = unsafe { PQstatus(conn.as_ptr()) };
        if !matches!(status, ConnStatusType::CONNECTION_OK) {
            let message = unsafe { text(PQerrorMessage(conn.as_ptr())) };
            unsafe { PQfinish(conn.as_ptr()) };
            return Err(NativeError::ConnectionFailure(message.trim_end().to_string()));
        }

        // Sends must never block the calling thread; the executor flushes.
        if unsafe { PQsetnonblocking(conn.as_ptr(), 1) } != 0 {
            let message = unsafe { text(PQerrorMessage(conn.as_ptr())) };
            unsafe { PQfinish(conn.as_ptr()) };
            return Err(NativeError::ConnectionFailure(format!(
                "cannot enter nonblocking mode: {}",
                message.trim_end()
            )));
        }

        Ok(Box::new(PqClient { conn }))
    }
}

struct PqClient {
    conn: NonNull<PGconn>,
}

// A PGconn may move between threads as long as it is never used by two at
// once; &mut self on every call that touches the wire guarantees that.
unsafe impl Send for PqClient {}

impl PqClient {
    fn last_error(&self) -> String {
        // SAFETY: the handle stays live until finish consumes self.
        unsafe { text(PQerrorMessage(self.conn.as_ptr())) }
            .trim_end()
            .to_string()
    }

    fn is_bad(&self) -> bool {
        let status = unsafe { PQstatus(self.conn.as_ptr()) };
        !matches!(status, ConnStatusType::CONNECTION_OK)
    }

    fn failure(&self) -> NativeError {
        if self.is_bad() {
            NativeError::ConnectionFailure(self.last_error())
        } else {
            NativeError::Library(self.last_error())
        }
    }
}

impl NativeClient for PqClient {
    fn send_query(&mut self, query: &str, params: &[&str]) -> Result<(), NativeError> {
        let query = CString::new(query)
            .map_err(|_| NativeError::Library("query contains a NUL byte".into()))?;
        let values = params
            .iter()
            .map(|p| CString::new(*p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| NativeError::Library("parameter contains a NUL byte".into()))?;
        let pointers: Vec<*const c_char> = values.iter().map(|v| v.as_ptr()).collect();
        let nparams = c_int::try_from(pointers.len())
            .map_err(|_| NativeError::Library("too many parameters".into()))?;

        // SAFETY: every pointer refers to a CString that outlives the call.
        // Null types, lengths and formats mean untyped text parameters.
        let sent = unsafe {
            PQsendQueryParams(
                self.conn.as_ptr(),
                query.as_ptr(),
                nparams,
                ptr::null(),
                if pointers.is_empty() { ptr::null() } else { pointers.as_ptr() },
                ptr::null(),
                ptr::null(),
                0,
            )
        };
        if sent == 1 {
            Ok(())
        } else {
            Err(self.failure())
        }
    }

    fn flush(&mut self) -> Result<bool, NativeError> {
        match unsafe { PQflush(self.conn.as_ptr()) } {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(self.failure()),
        }
    }

    fn consume_input(&mut self) -> Result<(), NativeError> {
        if unsafe { PQconsumeInput(self.conn.as_ptr()) } == 1 {
            Ok(())
        } else {
            Err(self.failure())
        }
    }

    fn is_busy(&self) -> bool {
        unsafe { PQisBusy(self.conn.as_ptr()) == 1 }
    }

    fn get_result(&mut self) -> Option<Box<dyn NativeResult>> {
        let raw = unsafe { PQgetResult(self.conn.as_ptr()) };
        NonNull::new(raw).map(|result| Box::new(PqResult { result }) as Box<dyn NativeResult>)
    }

    fn finish(self: Box<Self>) {
        // SAFETY: consuming self means no other reference to the handle exists.
        unsafe { PQfinish(self.conn.as_ptr()) };
    }
}

struct PqResult {
    result: NonNull<PGresult>,
}

// PGresult is immutable once returned and independent of its connection.
unsafe impl Send for PqResult {}

impl NativeResult for PqResult {
    fn status(&self) -> ExecStatus {
        match unsafe { PQresultStatus(self.result.as_ptr()) } {
            ExecStatusType::PGRES_EMPTY_QUERY => ExecStatus::EmptyQuery,
            ExecStatusType::PGRES_COMMAND_OK => ExecStatus::CommandOk,
            ExecStatusType::PGRES_TUPLES_OK => ExecStatus::TuplesOk,
            ExecStatusType::PGRES_COPY_OUT => ExecStatus::CopyOut,
            ExecStatusType::PGRES_COPY_IN => ExecStatus::CopyIn,
            ExecStatusType::PGRES_BAD_RESPONSE => ExecStatus::BadResponse,
            ExecStatusType::PGRES_NONFATAL_ERROR => ExecStatus::NonfatalError,
            ExecStatusType::PGRES_FATAL_ERROR => ExecStatus::FatalError,
            ExecStatusType::PGRES_COPY_BOTH => ExecStatus::CopyBoth,
            ExecStatusType::PGRES_SINGLE_TUPLE => ExecStatus::SingleTuple,
            // Pipeline statuses never occur outside pipeline mode.
            #[allow(unreachable_patterns)]
            _ => ExecStatus::BadResponse,
        }
    }

    fn ntuples(&self) -> usize {
        unsafe { PQntuples(self.result.as_ptr()) }.max(0) as usize
    }

    fn nfields(&self) -> usize {
        unsafe { PQnfields(self.result.as_ptr()) }.max(0) as usize
    }

    fn get_value(&self, tuple: usize, field: usize) -> Result<String, NativeError> {
        let ntuples = self.ntuples();
        if tuple >= ntuples {
            return Err(NativeError::TupleOutOfRange { tuple, ntuples });
        }
        let nfields = self.nfields();
        if field >= nfields {
            return Err(NativeError::FieldOutOfRange { field, nfields });
        }

        // Both indices are below counts that came from c_int values.
        let (row, col) = (tuple as c_int, field as c_int);
        // SAFETY: indices were checked against the result's bounds above.
        unsafe {
            if PQgetisnull(self.result.as_ptr(), row, col) == 1 {
                return Ok(String::new());
            }
            Ok(text(PQgetvalue(self.result.as_ptr(), row, col)))
        }
    }

    fn error_message(&self) -> String {
        unsafe { text(PQresultErrorMessage(self.result.as_ptr())) }
    }
}

impl Drop for PqResult {
    fn drop(&mut self) {
        unsafe { PQclear(self.result.as_ptr()) };
    }
}

/// Copy a libpq-owned string.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
unsafe fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

//! In-process driver.
//!
//! Every client opened from one [`MemoryDriver`] shares a table store and
//! understands a small SQL subset: `CREATE TABLE`, `DROP TABLE`, `INSERT`,
//! `SELECT` (including `COUNT(*)`, a `WHERE a = b AND ...` filter and
//! `ORDER BY`), `UPDATE`, `DELETE`, `RETURNING`, and transaction control.
//!
//! Clients behave like a libpq connection driven through its asynchronous
//! interface: a sent query reports busy for a configurable number of
//! `consume_input` polls, results must be drained before the next send, and
//! errors come back as `FatalError` results. Transactions read from a
//! private snapshot and replay their writes on `COMMIT`.
//!
//! ```ignore
//! use std::sync::Arc;
//! use pqexec::{Connection, MemoryDriver, Queryable};
//!
//! let driver = MemoryDriver::new().with_latency(3);
//! let conn = Connection::connect(Arc::new(driver.clone()), "memory").await?;
//! conn.command("CREATE TABLE t (id int)", &[]).await?;
//! ```

mod sql;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::{Driver, ExecStatus, NativeClient, NativeError, NativeResult};
use sql::{Cell, Database, Outcome, Statement};

/// Driver backed by an in-process table store.
///
/// Cloning is cheap; clones share the store and the counters.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    db: Mutex<Database>,
    latency: AtomicUsize,
    refuse: AtomicBool,
    generation: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Shared {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn query_drained(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `consume_input` polls each query stays busy for.
    pub fn with_latency(self, polls: usize) -> Self {
        self.set_latency(polls);
        self
    }

    pub fn set_latency(&self, polls: usize) {
        self.shared.latency.store(polls, Ordering::SeqCst);
    }

    /// Make every new `connect` fail.
    pub fn fail_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Sever every client opened so far. Their next call reports a
    /// connection failure; clients opened afterwards are unaffected.
    pub fn break_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Successful connects so far.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Clients finished so far.
    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Queries sent but not yet drained, across all clients.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` value observed.
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Driver for MemoryDriver {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn NativeClient>, NativeError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(NativeError::ConnectionFailure(format!(
                "could not connect to server \"{conninfo}\": Connection refused"
            )));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryClient {
            shared: Arc::clone(&self.shared),
            generation: self.shared.generation.load(Ordering::SeqCst),
            txn: None,
            pending: VecDeque::new(),
            busy_polls: 0,
            in_progress: false,
        }))
    }
}

struct Txn {
    snapshot: Database,
    writes: Vec<Statement>,
    aborted: bool,
}

struct MemoryClient {
    shared: Arc<Shared>,
    generation: u64,
    txn: Option<Txn>,
    pending: VecDeque<MemoryResult>,
    busy_polls: usize,
    in_progress: bool,
}

impl MemoryClient {
    fn check_alive(&self) -> Result<(), NativeError> {
        if self.generation != self.shared.generation.load(Ordering::SeqCst) {
            return Err(NativeError::ConnectionFailure(
                "server closed the connection unexpectedly".to_string(),
            ));
        }
        Ok(())
    }

    fn run(&mut self, query: &str, params: &[&str]) -> MemoryResult {
        match sql::parse(query, params) {
            Ok(Some(statement)) => self.execute(statement),
            Ok(None) => MemoryResult::status(ExecStatus::EmptyQuery),
            Err(msg) => self.fail(msg),
        }
    }

    fn execute(&mut self, statement: Statement) -> MemoryResult {
        match statement {
            Statement::Begin => {
                if self.txn.is_none() {
                    self.txn = Some(Txn {
                        snapshot: self.shared.db().clone(),
                        writes: Vec::new(),
                        aborted: false,
                    });
                }
                MemoryResult::status(ExecStatus::CommandOk)
            }
            Statement::Commit => {
                if let Some(txn) = self.txn.take() {
                    if !txn.aborted {
                        // Writes land all at once or not at all.
                        let mut db = self.shared.db();
                        let mut staged = db.clone();
                        for write in &txn.writes {
                            if let Err(msg) = staged.apply(write) {
                                drop(db);
                                return self.fail(msg);
                            }
                        }
                        *db = staged;
                    }
                }
                MemoryResult::status(ExecStatus::CommandOk)
            }
            Statement::Rollback => {
                self.txn = None;
                MemoryResult::status(ExecStatus::CommandOk)
            }
            statement => {
                let outcome = match self.txn.as_mut() {
                    Some(txn) if txn.aborted => Err(
                        "current transaction is aborted, commands ignored until end of transaction block"
                            .to_string(),
                    ),
                    Some(txn) => {
                        let outcome = txn.snapshot.apply(&statement);
                        if outcome.is_ok() && statement.is_write() {
                            txn.writes.push(statement);
                        }
                        outcome
                    }
                    None => self.shared.db().apply(&statement),
                };
                match outcome {
                    Ok(outcome) => MemoryResult::from(outcome),
                    Err(msg) => self.fail(msg),
                }
            }
        }
    }

    fn fail(&mut self, msg: String) -> MemoryResult {
        if let Some(txn) = self.txn.as_mut() {
            txn.aborted = true;
        }
        MemoryResult {
            status: ExecStatus::FatalError,
            nfields: 0,
            rows: Vec::new(),
            error: format!("ERROR:  {msg}\n"),
        }
    }
}

impl NativeClient for MemoryClient {
    fn send_query(&mut self, query: &str, params: &[&str]) -> Result<(), NativeError> {
        self.check_alive()?;
        if self.in_progress {
            return Err(NativeError::Library(
                "another command is already in progress".to_string(),
            ));
        }
        trace!(query, "memory driver received query");
        let result = self.run(query, params);
        self.pending.push_back(result);
        self.in_progress = true;
        self.busy_polls = self.shared.latency.load(Ordering::SeqCst);
        self.shared.query_started();
        Ok(())
    }

    fn consume_input(&mut self) -> Result<(), NativeError> {
        self.check_alive()?;
        self.busy_polls = self.busy_polls.saturating_sub(1);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.busy_polls > 0
    }

    fn get_result(&mut self) -> Option<Box<dyn NativeResult>> {
        // A busy client would block here until input arrives.
        self.busy_polls = 0;
        match self.pending.pop_front() {
            Some(result) => Some(Box::new(result)),
            None => {
                if self.in_progress {
                    self.in_progress = false;
                    self.shared.query_drained();
                }
                None
            }
        }
    }

    fn finish(self: Box<Self>) {
        if self.in_progress {
            self.shared.query_drained();
        }
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct MemoryResult {
    status: ExecStatus,
    nfields: usize,
    rows: Vec<Vec<Cell>>,
    error: String,
}

impl MemoryResult {
    fn status(status: ExecStatus) -> Self {
        Self {
            status,
            nfields: 0,
            rows: Vec::new(),
            error: String::new(),
        }
    }
}

impl From<Outcome> for MemoryResult {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Command => Self::status(ExecStatus::CommandOk),
            Outcome::Rows { nfields, rows } => Self {
                status: ExecStatus::TuplesOk,
                nfields,
                rows,
                error: String::new(),
            },
        }
    }
}

impl NativeResult for MemoryResult {
    fn status(&self) -> ExecStatus {
        self.status
    }

    fn ntuples(&self) -> usize {
        self.rows.len()
    }

    fn nfields(&self) -> usize {
        self.nfields
    }

    fn get_value(&self, tuple: usize, field: usize) -> Result<String, NativeError> {
        let row = self.rows.get(tuple).ok_or(NativeError::TupleOutOfRange {
            tuple,
            ntuples: self.rows.len(),
        })?;
        let cell = row.get(field).ok_or(NativeError::FieldOutOfRange {
            field,
            nfields: self.nfields,
        })?;
        Ok(cell.clone().unwrap_or_default())
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }
}

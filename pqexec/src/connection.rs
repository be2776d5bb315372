//! A single database connection

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::driver::{NativeClient, NativeResult, SharedDriver};
use crate::error::{Error, Result};
use crate::executor;
use crate::mapper;
use crate::row::Row;
use crate::traits::{IsolationLevel, Queryable};
use crate::transaction::Transaction;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Whether the native handle is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Open,
    Closed,
}

/// A connection owning exactly one native client handle.
///
/// Queries go through [`Queryable`]. Only one operation may use the
/// connection at a time; a second concurrent call fails with
/// [`Error::Busy`] rather than interleaving with the first on the wire.
///
/// Dropping the connection closes the handle on the blocking thread pool.
///
/// # Example
///
/// ```ignore
/// let conn = Connection::connect(driver, "host=localhost dbname=app").await?;
/// conn.command("INSERT INTO users (name) VALUES ($1)", &["alice"]).await?;
/// let user = conn.one("SELECT id, name FROM users WHERE name = $1", &["alice"]).await?;
/// conn.finish().await?;
/// ```
pub struct Connection {
    id: u64,
    // The lock is only ever taken with try_lock; holding it is what makes a
    // query "in progress" for every other caller.
    session: Mutex<Session>,
}

struct Session {
    client: Option<Box<dyn NativeClient>>,
    liveness: Liveness,
    // Set while a query is being drained. Still set afterwards means the
    // caller abandoned the query and the wire state is unknown.
    in_flight: bool,
    // A transaction was dropped while active on this connection.
    rollback_owed: bool,
}

impl Connection {
    /// Open a connection. The blocking connect runs off the async threads.
    pub async fn connect(driver: SharedDriver, conninfo: &str) -> Result<Self> {
        let conninfo = conninfo.to_string();
        let client = tokio::task::spawn_blocking(move || driver.connect(&conninfo))
            .await
            .map_err(|e| Error::ConnectionFailure(format!("connect task failed: {e}")))??;

        let conn = Self::from_client(client);
        debug!(connection = conn.id, "connected");
        Ok(conn)
    }

    pub(crate) fn from_client(client: Box<dyn NativeClient>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            session: Mutex::new(Session {
                client: Some(client),
                liveness: Liveness::Open,
                in_flight: false,
                rollback_owed: false,
            }),
        }
    }

    /// Process-unique identifier, used in log output.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current liveness. A connection busy with a query counts as open.
    pub fn liveness(&self) -> Liveness {
        self.session
            .try_lock()
            .map(|session| session.liveness)
            .unwrap_or(Liveness::Open)
    }

    /// Close the connection. The blocking close runs off the async threads.
    pub async fn finish(mut self) -> Result<()> {
        let client = self.session.get_mut().client.take();
        if let Some(client) = client {
            tokio::task::spawn_blocking(move || client.finish())
                .await
                .map_err(|e| Error::ConnectionFailure(format!("close task failed: {e}")))?;
        }
        debug!(connection = self.id, "finished");
        Ok(())
    }

    /// Begin a transaction that borrows this connection until it ends.
    pub async fn begin(&mut self) -> Result<Transaction<&mut Connection>> {
        Transaction::begin(self).await
    }

    /// Begin a transaction at the given isolation level.
    pub async fn begin_with(
        &mut self,
        level: IsolationLevel,
    ) -> Result<Transaction<&mut Connection>> {
        Transaction::begin_with(self, level).await
    }

    /// Whether the connection can be handed to another caller.
    ///
    /// A connection still inside an abandoned transaction is not: its server
    /// transaction stays open until the next statement, so it is closed
    /// instead.
    pub(crate) fn is_reusable(&mut self) -> bool {
        let session = self.session.get_mut();
        session.client.is_some()
            && session.liveness == Liveness::Open
            && !session.in_flight
            && !session.rollback_owed
    }

    /// Record that the next statement must be preceded by a ROLLBACK.
    pub(crate) fn owe_rollback(&mut self) {
        self.session.get_mut().rollback_owed = true;
    }

    async fn run(&self, query: &str, params: &[&str]) -> Result<Box<dyn NativeResult>> {
        let mut session = self.session.try_lock().map_err(|_| Error::Busy)?;

        if session.rollback_owed {
            session.rollback_owed = false;
            debug!(connection = self.id, "rolling back abandoned transaction");
            let result = session.execute(self.id, "ROLLBACK", &[]).await?;
            mapper::expect_command(result.as_ref())?;
        }

        session.execute(self.id, query, params).await
    }
}

impl Session {
    async fn execute(
        &mut self,
        id: u64,
        query: &str,
        params: &[&str],
    ) -> Result<Box<dyn NativeResult>> {
        if self.in_flight {
            return Err(Error::Busy);
        }
        let client = match (self.liveness, self.client.as_mut()) {
            (Liveness::Open, Some(client)) => client,
            _ => return Err(Error::ConnectionFailure("connection is closed".to_string())),
        };

        self.in_flight = true;
        let outcome = executor::execute(client.as_mut(), query, params).await;
        self.in_flight = false;

        if let Err(Error::ConnectionFailure(msg)) = &outcome {
            warn!(connection = id, error = %msg, "connection lost");
            self.liveness = Liveness::Closed;
        }
        outcome
    }
}

#[async_trait]
impl Queryable for Connection {
    async fn one(&self, query: &str, params: &[&str]) -> Result<Option<Row>> {
        let result = self.run(query, params).await?;
        mapper::expect_tuples(result.as_ref(), query)?;
        mapper::read_first(result.as_ref())
    }

    async fn all(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        let result = self.run(query, params).await?;
        mapper::expect_tuples(result.as_ref(), query)?;
        mapper::read_rows(result.as_ref())
    }

    async fn command(&self, query: &str, params: &[&str]) -> Result<()> {
        let result = self.run(query, params).await?;
        mapper::expect_command(result.as_ref())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(client) = self.session.get_mut().client.take() {
            debug!(connection = self.id, "closing dropped connection");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || client.finish());
                }
                Err(_) => client.finish(),
            }
        }
    }
}

/// Open a connection with a driver that is not yet shared.
pub async fn connect<D: crate::driver::Driver>(driver: D, conninfo: &str) -> Result<Connection> {
    Connection::connect(Arc::new(driver), conninfo).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::driver::ExecStatus;

    async fn open(driver: &MemoryDriver) -> Connection {
        Connection::connect(Arc::new(driver.clone()), "memory")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_primitives() {
        let driver = MemoryDriver::new().with_latency(2);
        let conn = open(&driver).await;

        conn.command("CREATE TABLE users (id int, name text)", &[])
            .await
            .unwrap();
        conn.command("INSERT INTO users VALUES ($1, $2)", &["1", "alice"])
            .await
            .unwrap();
        let returned = conn
            .command_returning(
                "INSERT INTO users VALUES ($1, $2) RETURNING id",
                &["2", "bob"],
            )
            .await
            .unwrap();
        assert_eq!(returned, vec![Row::new(vec!["2".into()])]);

        let row = conn
            .one("SELECT id, name FROM users WHERE id = $1", &["1"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, ["1", "alice"]);

        let missing = conn
            .one("SELECT id FROM users WHERE id = $1", &["9"])
            .await
            .unwrap();
        assert_eq!(missing, None);

        assert_eq!(conn.all("SELECT * FROM users", &[]).await.unwrap().len(), 2);
        conn.finish().await.unwrap();
        assert_eq!(driver.closes(), 1);
    }

    #[tokio::test]
    async fn test_status_errors() {
        let driver = MemoryDriver::new();
        let conn = open(&driver).await;

        let err = conn.all("CREATE TABLE t (a int)", &[]).await.unwrap_err();
        assert_eq!(
            err,
            Error::UnexpectedStatus {
                got: ExecStatus::CommandOk,
                query: "CREATE TABLE t (a int)".into(),
                expected: vec![ExecStatus::TuplesOk],
            }
        );

        let err = conn.command("DROP TABLE nope", &[]).await.unwrap_err();
        assert_eq!(
            err,
            Error::ResultError("ERROR:  table \"nope\" does not exist".into())
        );

        let err = conn.command("", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ResultError(_)));
    }

    #[tokio::test]
    async fn test_concurrent_use_is_rejected() {
        let driver = MemoryDriver::new().with_latency(50);
        let conn = open(&driver).await;

        let (first, second) = tokio::join!(conn.one("SELECT 1", &[]), conn.one("SELECT 2", &[]));
        assert_eq!(first.unwrap().unwrap(), ["1"]);
        assert_eq!(second, Err(Error::Busy));

        // The connection is still usable afterwards.
        assert!(conn.one("SELECT 3", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_loss_closes() {
        let driver = MemoryDriver::new();
        let conn = open(&driver).await;
        driver.break_connections();

        let err = conn.one("SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(conn.liveness(), Liveness::Closed);

        let err = conn.one("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err, Error::ConnectionFailure("connection is closed".into()));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let driver = MemoryDriver::new();
        driver.fail_connections(true);
        let err = connect(driver, "host=nowhere").await.unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[tokio::test]
    async fn test_drop_closes_handle() {
        let driver = MemoryDriver::new();
        let conn = open(&driver).await;
        drop(conn);
        for _ in 0..100 {
            if driver.closes() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(driver.closes(), 1);
    }
}

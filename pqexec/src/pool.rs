//! Bounded connection pool

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, trace, warn};

use crate::config::{defaults, PoolConfig};
use crate::connection::Connection;
use crate::driver::SharedDriver;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::traits::{IsolationLevel, Queryable, Transactional};
use crate::transaction::Transaction;

/// A fixed-capacity pool of connections.
///
/// Connections are opened lazily, up to `size`, and reused afterwards.
/// When every connection is checked out, `checkout` waits; waiters are
/// served in arrival order. Cloning is cheap: clones share the same pool.
///
/// A failed connect is fatal for the pool. The checkout that hit it returns
/// the error, and so do all queued and later checkouts.
///
/// # Example
///
/// ```ignore
/// use pqexec::{Pool, Queryable};
///
/// let pool = Pool::new(driver, "host=localhost dbname=app", 8)?;
/// let rows = pool.all("SELECT id, name FROM users", &[]).await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<SharedPool>,
}

struct SharedPool {
    driver: SharedDriver,
    conninfo: String,
    size: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    live: AtomicUsize,
    failure: OnceLock<Error>,
}

impl SharedPool {
    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, mut conn: Connection) {
        if conn.is_reusable() && !self.semaphore.is_closed() {
            trace!(connection = conn.id(), "connection released");
            self.idle().push(conn);
        } else {
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(connection = conn.id(), "discarding connection");
        }
    }
}

impl Pool {
    /// Create a pool of at most `size` connections to `conninfo`.
    ///
    /// No connection is opened until the first checkout.
    pub fn new(driver: SharedDriver, conninfo: &str, size: usize) -> Result<Self> {
        Self::builder(driver, conninfo).size(size).build()
    }

    /// Create a pool from loaded configuration.
    pub fn from_config(driver: SharedDriver, config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        Self::new(driver, &config.conninfo, config.size)
    }

    /// Create a builder for configuring the pool.
    pub fn builder(driver: SharedDriver, conninfo: &str) -> PoolBuilder {
        PoolBuilder::new(driver, conninfo)
    }

    /// Check out a connection, waiting for one if all are in use.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        if let Some(err) = self.inner.failure.get() {
            return Err(err.clone());
        }

        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;

        let idle = self.inner.idle().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open().await?,
        };

        trace!(connection = conn.id(), "connection checked out");
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Return a connection to the pool. Dropping it has the same effect.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    async fn open(&self) -> Result<Connection> {
        match Connection::connect(Arc::clone(&self.inner.driver), &self.inner.conninfo).await {
            Ok(conn) => {
                let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(connection = conn.id(), live, size = self.inner.size, "pool grew");
                Ok(conn)
            }
            Err(err) => {
                error!(error = %err, "pool connect failed, pool is unusable");
                let _ = self.inner.failure.set(err.clone());
                self.inner.semaphore.close();
                Err(err)
            }
        }
    }

    fn closed_error(&self) -> Error {
        self.inner
            .failure
            .get()
            .cloned()
            .unwrap_or_else(|| Error::ConnectionFailure("pool is closed".to_string()))
    }

    /// Stop handing out connections and close the idle ones.
    ///
    /// Connections still checked out are closed when they are released.
    pub async fn close(&self) {
        self.inner.semaphore.close();
        let idle: Vec<Connection> = std::mem::take(&mut *self.inner.idle());
        for conn in idle {
            self.inner.live.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = conn.finish().await {
                warn!(error = %e, "failed to close pooled connection");
            }
        }
        debug!("pool closed");
    }

    /// Maximum number of live connections.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Connections currently open, idle or checked out.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Connections open and waiting in the pool.
    pub fn idle(&self) -> usize {
        self.inner.idle().len()
    }

    /// Checkouts currently held.
    pub fn checked_out(&self) -> usize {
        self.inner.size - self.inner.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("live", &self.live())
            .field("idle", &self.idle())
            .finish()
    }
}

/// Builder for configuring a [`Pool`].
///
/// # Example
///
/// ```ignore
/// let pool = Pool::builder(driver, "host=localhost dbname=app")
///     .size(16)
///     .build()?;
/// ```
pub struct PoolBuilder {
    driver: SharedDriver,
    conninfo: String,
    size: Option<usize>,
}

impl PoolBuilder {
    /// Create a new builder with the given driver and connection string.
    pub fn new(driver: SharedDriver, conninfo: &str) -> Self {
        Self {
            driver,
            conninfo: conninfo.to_string(),
            size: None,
        }
    }

    /// Set the maximum number of connections in the pool.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Build the [`Pool`] with the configured options.
    pub fn build(self) -> Result<Pool> {
        let size = self.size.unwrap_or(defaults::POOL_SIZE);
        if size == 0 {
            return Err(Error::Config("pool size must be at least 1".into()));
        }

        Ok(Pool {
            inner: Arc::new(SharedPool {
                driver: self.driver,
                conninfo: self.conninfo,
                size,
                semaphore: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                live: AtomicUsize::new(0),
                failure: OnceLock::new(),
            }),
        })
    }
}

/// A connection checked out of a [`Pool`].
///
/// Derefs to [`Connection`]. Goes back to the pool when dropped, whatever
/// the exit path; a connection that was lost or abandoned mid-query is
/// closed instead and its slot freed for a fresh one.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<SharedPool>,
    // Dropped after `conn` is returned, which wakes the next waiter.
    _permit: OwnedSemaphorePermit,
}

const EXPECT_MSG: &str = "BUG: pooled connection already released";

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect(EXPECT_MSG)
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect(EXPECT_MSG)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[async_trait]
impl Queryable for Pool {
    async fn one(&self, query: &str, params: &[&str]) -> Result<Option<Row>> {
        let conn = self.checkout().await?;
        conn.one(query, params).await
    }

    async fn all(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        let conn = self.checkout().await?;
        conn.all(query, params).await
    }

    async fn command(&self, query: &str, params: &[&str]) -> Result<()> {
        let conn = self.checkout().await?;
        conn.command(query, params).await
    }

    async fn command_returning(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        let conn = self.checkout().await?;
        conn.command_returning(query, params).await
    }
}

impl Transactional for Pool {
    type Tx = Transaction<PooledConnection>;

    async fn begin(&self) -> Result<Self::Tx> {
        let conn = self.checkout().await?;
        Transaction::begin(conn).await
    }

    async fn begin_with(&self, level: IsolationLevel) -> Result<Self::Tx> {
        let conn = self.checkout().await?;
        Transaction::begin_with(conn, level).await
    }

    async fn in_transaction<R, F>(&self, f: F) -> Result<R>
    where
        R: Send,
        F: for<'a> FnOnce(&'a Self::Tx) -> BoxFuture<'a, Result<R>> + Send,
    {
        let tx = self.begin().await?;
        finish_with(tx, f).await
    }

    async fn in_transaction_with<R, F>(&self, level: IsolationLevel, f: F) -> Result<R>
    where
        R: Send,
        F: for<'a> FnOnce(&'a Self::Tx) -> BoxFuture<'a, Result<R>> + Send,
    {
        let tx = self.begin_with(level).await?;
        finish_with(tx, f).await
    }
}

async fn finish_with<R, F>(tx: Transaction<PooledConnection>, f: F) -> Result<R>
where
    F: for<'a> FnOnce(&'a Transaction<PooledConnection>) -> BoxFuture<'a, Result<R>>,
{
    let outcome = f(&tx).await;
    match outcome {
        Ok(result) => {
            tx.commit().await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback after failed transaction body also failed");
            }
            Err(e)
        }
    }
}

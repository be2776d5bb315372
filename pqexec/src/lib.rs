//! pqexec - non-blocking query execution over a blocking PostgreSQL client
//!
//! Runs queries through a native client's asynchronous send / poll / drain
//! cycle without ever blocking a tokio worker, hands out connections from a
//! fixed-size FIFO pool, and wraps them in explicit transactions.
//!
//! # Features
//!
//! - **Three query primitives**: `one`, `all` and `command` (plus
//!   `command_returning`) on connections, pools and transactions alike
//! - **Bounded pool**: lazily opened connections, waiters served in order,
//!   release on every exit path
//! - **Transactions**: `begin` / `commit` / `rollback` with the connection
//!   held for the transaction's whole lifetime
//! - **Pluggable drivers**: `libpq` (feature `libpq`) or an in-memory
//!   driver for tests (feature `memory`)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pqexec::{Pool, Queryable, Transactional};
//! use pqexec::driver::libpq::LibPq;
//!
//! async fn rename(pool: &Pool, id: &str, name: &str) -> pqexec::Result<()> {
//!     pool.in_transaction(|tx| Box::pin(async move {
//!         tx.command("UPDATE users SET name = $1 WHERE id = $2", &[name, id]).await?;
//!         Ok(())
//!     }))
//!     .await
//! }
//!
//! let pool = Pool::new(Arc::new(LibPq), "host=localhost dbname=app", 8)?;
//! let user = pool.one("SELECT id, name FROM users WHERE id = $1", &["7"]).await?;
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
mod executor;
mod mapper;
pub mod pool;
pub mod row;
pub mod traits;
pub mod transaction;

// Re-export main types
pub use config::PoolConfig;
pub use connection::{connect, Connection, Liveness};
pub use driver::{Driver, ExecStatus, NativeClient, NativeError, NativeResult, SharedDriver};
pub use error::{Error, Result};
pub use pool::{Pool, PoolBuilder, PooledConnection};
pub use row::Row;
pub use traits::{IsolationLevel, Queryable, Transactional};
pub use transaction::{Transaction, TransactionState};

#[cfg(feature = "libpq")]
pub use driver::libpq::LibPq;
#[cfg(feature = "memory")]
pub use driver::memory::MemoryDriver;

//! Transactions over an exclusively held connection

use std::ops::DerefMut;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::row::Row;
use crate::traits::{IsolationLevel, Queryable};

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

/// A database transaction.
///
/// The transaction holds its connection exclusively: `C` is either a
/// `&mut Connection` or a pooled connection checked out for the
/// transaction's whole lifetime. `commit` and `rollback` consume the
/// transaction, so it cannot be used after it ends.
///
/// Dropping an active transaction does not leak it: a borrowed connection
/// issues a `ROLLBACK` before its next statement, and a pooled connection
/// is closed on release instead of going back to the idle list, which ends
/// the server-side transaction.
///
/// # Example
///
/// ```ignore
/// let tx = conn.begin().await?;
/// tx.command("INSERT INTO users (name) VALUES ($1)", &["alice"]).await?;
/// tx.command("INSERT INTO users (name) VALUES ($1)", &["bob"]).await?;
/// tx.commit().await?;
/// ```
pub struct Transaction<C>
where
    C: DerefMut<Target = Connection>,
{
    conn: C,
    state: TransactionState,
}

impl<C> Transaction<C>
where
    C: DerefMut<Target = Connection> + Send,
{
    /// Issue `BEGIN` on `conn`.
    ///
    /// On failure the connection is released with whatever state the
    /// server left it in.
    pub async fn begin(conn: C) -> Result<Self> {
        Self::start(conn, "BEGIN").await
    }

    /// Issue `BEGIN ISOLATION LEVEL ...` on `conn`.
    pub async fn begin_with(conn: C, level: IsolationLevel) -> Result<Self> {
        Self::start(conn, level.begin_statement()).await
    }

    async fn start(conn: C, statement: &str) -> Result<Self> {
        let mut tx = Self {
            conn,
            state: TransactionState::NotStarted,
        };
        tx.connection().command(statement, &[]).await?;
        tx.state = TransactionState::Active;
        debug!(connection = tx.connection().id(), "transaction started");
        Ok(tx)
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commit the transaction, making all changes permanent.
    ///
    /// The transaction is over whether or not the `COMMIT` succeeds.
    pub async fn commit(mut self) -> Result<()> {
        self.end("COMMIT", TransactionState::Committed).await
    }

    /// Rollback the transaction, discarding all changes.
    pub async fn rollback(mut self) -> Result<()> {
        self.end("ROLLBACK", TransactionState::RolledBack).await
    }

    async fn end(&mut self, statement: &str, terminal: TransactionState) -> Result<()> {
        self.state = terminal;
        let id = self.connection().id();
        match self.connection().command(statement, &[]).await {
            Ok(()) => {
                debug!(connection = id, state = ?terminal, "transaction ended");
                Ok(())
            }
            Err(e) => {
                warn!(connection = id, error = %e, "{statement} failed");
                Err(e)
            }
        }
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl<C> Queryable for Transaction<C>
where
    C: DerefMut<Target = Connection> + Send + Sync,
{
    async fn one(&self, query: &str, params: &[&str]) -> Result<Option<Row>> {
        self.connection().one(query, params).await
    }

    async fn all(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        self.connection().all(query, params).await
    }

    async fn command(&self, query: &str, params: &[&str]) -> Result<()> {
        self.connection().command(query, params).await
    }
}

impl<C> Drop for Transaction<C>
where
    C: DerefMut<Target = Connection>,
{
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            warn!(
                connection = self.conn.id(),
                "transaction dropped while active, rolling back on next use"
            );
            self.conn.owe_rollback();
        }
    }
}

//! Transaction traits for pqexec

use crate::error::Result;
use crate::traits::Queryable;
use futures::future::BoxFuture;
use std::future::Future;

/// Transaction isolation level.
///
/// Defines the degree to which one transaction must be isolated from
/// resource or data modifications made by other transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Behaves like `ReadCommitted` on PostgreSQL.
    ReadUncommitted,

    /// Each statement sees data committed before it began.
    /// This is the PostgreSQL default.
    #[default]
    ReadCommitted,

    /// All statements see a snapshot taken at the first statement.
    RepeatableRead,

    /// Provides full isolation. Transactions are completely isolated from one another.
    Serializable,
}

impl IsolationLevel {
    /// The `BEGIN` statement that opens a transaction at this level.
    pub fn begin_statement(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "BEGIN ISOLATION LEVEL READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// A source of connections that can begin transactions.
///
/// The transaction holds its connection exclusively until it is committed,
/// rolled back or dropped; only then does the connection become available
/// to anyone else.
///
/// # Usage
///
/// ## Callback Style (Recommended)
///
/// The callback style automatically commits on success and rolls back on error:
///
/// ```ignore
/// let id = pool.in_transaction(|tx| Box::pin(async move {
///     let rows = tx.command_returning(
///         "INSERT INTO orders (user_id) VALUES ($1) RETURNING id", &[user_id]).await?;
///     tx.command("UPDATE users SET orders = orders + 1 WHERE id = $1", &[user_id]).await?;
///     Ok(rows[0].get(0)?.to_string())
/// })).await?;
/// ```
///
/// ## Explicit Style
///
/// ```ignore
/// let tx = pool.begin().await?;
/// tx.command("INSERT INTO users (name) VALUES ($1)", &["alice"]).await?;
/// tx.commit().await?;
/// ```
pub trait Transactional: Queryable {
    /// The transaction type for this source.
    type Tx: Queryable;

    /// Begin a new transaction with the server's default isolation level.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Begin a new transaction with the specified isolation level.
    fn begin_with(&self, level: IsolationLevel) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Execute a closure within a transaction.
    ///
    /// The transaction is committed if the closure returns `Ok`, and rolled
    /// back if it returns `Err`.
    fn in_transaction<R, F>(&self, f: F) -> impl Future<Output = Result<R>> + Send
    where
        R: Send,
        F: for<'a> FnOnce(&'a Self::Tx) -> BoxFuture<'a, Result<R>> + Send;

    /// Execute a closure within a transaction with the specified isolation level.
    fn in_transaction_with<R, F>(
        &self,
        level: IsolationLevel,
        f: F,
    ) -> impl Future<Output = Result<R>> + Send
    where
        R: Send,
        F: for<'a> FnOnce(&'a Self::Tx) -> BoxFuture<'a, Result<R>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_statements() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(
            IsolationLevel::Serializable.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
        assert_eq!(
            IsolationLevel::RepeatableRead.begin_statement(),
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        );
    }
}

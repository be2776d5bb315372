//! The query interface shared by connections, pools and transactions

use crate::error::Result;
use crate::row::Row;
use async_trait::async_trait;

/// Something queries can be run against.
///
/// [`Connection`](crate::Connection), [`Pool`](crate::Pool) and
/// [`Transaction`](crate::Transaction) all implement this trait, so the
/// same code runs unchanged against any of them. Queries use positional
/// placeholders (`$1`, `$2`, ...) and every parameter is text; values are
/// handed to the driver, never spliced into the SQL.
///
/// # Example
///
/// ```ignore
/// async fn find_user(db: &impl Queryable, id: &str) -> pqexec::Result<Option<Row>> {
///     db.one("SELECT id, name FROM users WHERE id = $1", &[id]).await
/// }
/// ```
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Fetch the first row, or `None` if the query returned no rows.
    async fn one(&self, query: &str, params: &[&str]) -> Result<Option<Row>>;

    /// Fetch every row.
    async fn all(&self, query: &str, params: &[&str]) -> Result<Vec<Row>>;

    /// Run a statement for its effect. A `RETURNING` clause is allowed but
    /// its rows are discarded.
    async fn command(&self, query: &str, params: &[&str]) -> Result<()>;

    /// Run a data-modifying statement with a `RETURNING` clause.
    async fn command_returning(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        self.all(query, params).await
    }
}

#[async_trait]
impl<Q: Queryable + ?Sized> Queryable for &Q {
    async fn one(&self, query: &str, params: &[&str]) -> Result<Option<Row>> {
        (**self).one(query, params).await
    }

    async fn all(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        (**self).all(query, params).await
    }

    async fn command(&self, query: &str, params: &[&str]) -> Result<()> {
        (**self).command(query, params).await
    }

    async fn command_returning(&self, query: &str, params: &[&str]) -> Result<Vec<Row>> {
        (**self).command_returning(query, params).await
    }
}

//! The seam between the write layer and a concrete database.
//!
//! Backends implement [`SqlConnection`] for one pooled connection and
//! [`ConnectionSource`] for the pool that hands them out. Dropping a
//! connection returns it to its pool.

use async_trait::async_trait;
use tracing::error;

use chainrevert_core::error::DbError;
use chainrevert_core::sql::Statement;
use chainrevert_core::value::{Row, Value};

/// One database connection. Statements use `?` placeholders.
#[async_trait]
pub trait SqlConnection: Send + 'static {
    /// Run a statement, returning how many rows it affected.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Run a statement and collect every row it returns.
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError>;
}

/// Hands out pooled connections.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: SqlConnection;

    async fn acquire(&self) -> Result<Self::Connection, DbError>;
}

pub(crate) async fn execute_logged<C: SqlConnection>(
    conn: &mut C,
    stmt: &Statement,
) -> Result<u64, DbError> {
    conn.execute(&stmt.sql, &stmt.params).await.map_err(|e| {
        error!(sql = %stmt.sql, params = ?stmt.params, error = %e, "statement failed");
        e
    })
}

pub(crate) async fn fetch_logged<C: SqlConnection>(
    conn: &mut C,
    stmt: &Statement,
) -> Result<Vec<Row>, DbError> {
    conn.fetch_all(&stmt.sql, &stmt.params).await.map_err(|e| {
        error!(sql = %stmt.sql, params = ?stmt.params, error = %e, "query failed");
        e
    })
}

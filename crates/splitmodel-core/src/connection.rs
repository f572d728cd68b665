//! Database connection trait.
//!
//! The session and migration layers talk to the database only through
//! [`Connection`]. Every call takes a `Cx` so cancellation and budgets from
//! asupersync flow into the driver. Transactions are driven with plain
//! `BEGIN` / `SAVEPOINT` / `COMMIT` statements by the caller.

use crate::error::Result;
use crate::row::Row;
use crate::types::{BackendFeatures, Dialect};
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A database connection capable of executing queries.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT \"aid\" FROM \"testapp_parenta\" WHERE \"aid\" = ?1", &[Value::BigInt(1)]).await;
/// ```
pub trait Connection: Send + Sync {
    /// The SQL dialect this connection speaks.
    fn dialect(&self) -> Dialect;

    /// Optional features the backend supports.
    fn features(&self) -> BackendFeatures {
        BackendFeatures::for_dialect(self.dialect())
    }

    /// Quote a table or column name for this connection.
    fn quote_name(&self, name: &str) -> String {
        self.dialect().quote_ident(name)
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE, DDL) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the generated key of the new row.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Execute multiple statements in order, returning rows affected by each.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, crate::Error>> + Send;

    /// Check if the connection is still valid.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Close the connection gracefully.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

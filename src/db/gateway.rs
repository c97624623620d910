//! Persistence gateway: pooled, parameterized SQL execution.
//!
//! The lease store only talks to these traits. Backends live in
//! [`super::postgres`] and [`super::sqlite`]; tests plug in their own.

use async_trait::async_trait;

use crate::error::Result;

/// A bound parameter or a result cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One result row, cells in select-list order.
pub type Row = Vec<Value>;

/// A connection checked out of a gateway.
///
/// Placeholders are `$1`, `$2`, ... and bind `params` positionally.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement that returns rows.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement and return the number of rows it affected.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Hand the connection back to its pool.
    fn release(self: Box<Self>);
}

/// Source of pooled connections.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Check out a connection. `Ok(None)` means the pool had nothing to give.
    async fn connection(&self) -> Result<Option<Box<dyn Connection>>>;
}

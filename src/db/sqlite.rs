//! SQLite gateway for single-node runs and tests.
//!
//! One underlying rusqlite connection, handed out as a bounded number of
//! connection handles. A handle that is never released keeps its slot, so
//! a leak shows up as pool exhaustion just as it would against Postgres.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::gateway::{Connection, Gateway, Row, Value};
use crate::error::{Error, Result};

const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteGateway {
    conn: Arc<Mutex<rusqlite::Connection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl SqliteGateway {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(rusqlite::Connection::open_in_memory()?))
    }

    fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONNECTIONS)),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Bound the number of handles that may be checked out at once.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max));
        self
    }

    /// How long `connection()` waits for a free handle before giving up.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Handles not currently checked out.
    pub fn idle_connections(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Gateway for SqliteGateway {
    async fn connection(&self) -> Result<Option<Box<dyn Connection>>> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await;

        match permit {
            Ok(Ok(permit)) => Ok(Some(Box::new(SqliteConnection {
                conn: Arc::clone(&self.conn),
                _permit: permit,
            }))),
            Ok(Err(e)) => Err(Error::ConnectionUnavailable(e.to_string())),
            Err(_) => {
                warn!(
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "timed out waiting for a sqlite connection handle"
                );
                Ok(None)
            }
        }
    }
}

struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.conn, sql, params)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.conn, sql, params)
    }

    fn release(self: Box<Self>) {
        // Dropping the permit frees the slot.
        drop(self);
    }
}

/// `$n` placeholders become SQLite's `?n`.
fn positional(sql: &str) -> String {
    sql.replace('$', "?")
}

fn bind(params: &[Value]) -> impl Iterator<Item = SqlValue> + '_ {
    params.iter().map(|p| match p {
        Value::Null => SqlValue::Null,
        Value::Int(n) => SqlValue::Integer(*n),
        Value::Text(s) => SqlValue::Text(s.clone()),
    })
}

fn lock(conn: &Mutex<rusqlite::Connection>) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
    conn.lock()
        .map_err(|_| Error::Other("sqlite connection mutex poisoned".to_string()))
}

fn run_query(conn: &Mutex<rusqlite::Connection>, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let conn = lock(conn)?;
    let mut stmt = conn.prepare(&positional(sql))?;
    let width = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(bind(params)))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            let cell = match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(n) => Value::Int(n),
                ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Real(_) | ValueRef::Blob(_) => {
                    return Err(Error::Protocol(format!(
                        "column {i} has a type the gateway does not carry"
                    )));
                }
            };
            cells.push(cell);
        }
        out.push(cells);
    }
    Ok(out)
}

fn run_execute(conn: &Mutex<rusqlite::Connection>, sql: &str, params: &[Value]) -> Result<u64> {
    let conn = lock(conn)?;
    let changed = conn.execute(&positional(sql), rusqlite::params_from_iter(bind(params)))?;
    Ok(changed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_become_numbered_parameters() {
        assert_eq!(
            positional("UPDATE owners SET a = $1 WHERE b = $2 AND $1 > c"),
            "UPDATE owners SET a = ?1 WHERE b = ?2 AND ?1 > c"
        );
    }

    #[tokio::test]
    async fn reused_parameter_binds_once() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let mut conn = gateway.connection().await.unwrap().unwrap();
        let rows = conn
            .query("SELECT $1 + $1, $2", &[Value::Int(21), Value::from("x")])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(42), Value::Text("x".to_string())]]);
        conn.release();
    }

    #[tokio::test]
    async fn real_columns_are_a_protocol_error() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let mut conn = gateway.connection().await.unwrap().unwrap();
        let err = conn.query("SELECT 1.5", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        conn.release();
    }

    #[tokio::test]
    async fn unreleased_handle_holds_its_slot() {
        let gateway = SqliteGateway::in_memory()
            .unwrap()
            .with_max_connections(1)
            .with_acquire_timeout(Duration::from_millis(10));

        let held = gateway.connection().await.unwrap().unwrap();
        assert_eq!(gateway.idle_connections(), 0);
        assert!(gateway.connection().await.unwrap().is_none());

        held.release();
        assert_eq!(gateway.idle_connections(), 1);
        assert!(gateway.connection().await.unwrap().is_some());
    }
}

//! Lease store: the owners, work item and activity log tables, and every
//! operation over them.
//!
//! Each operation checks out one connection through [`Db::scoped`] and
//! hands it back on every exit path.

pub mod gateway;
pub mod lease;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod work;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::error;

use crate::error::{Error, Result};
use gateway::{Connection, Gateway};
use postgres::PgGateway;
use sqlite::SqliteGateway;

/// Database handle. Cheap to clone; clones share the gateway.
#[derive(Clone)]
pub struct Db {
    gateway: Arc<dyn Gateway>,
}

impl Db {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Open a database by URL.
    ///
    /// `postgres://` and `postgresql://` use a pooled Postgres gateway;
    /// `sqlite::memory:` and `sqlite://<path>` use SQLite.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        let gateway: Arc<dyn Gateway> =
            if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                Arc::new(PgGateway::connect(url, max_connections).await?)
            } else if url == "sqlite::memory:" {
                Arc::new(SqliteGateway::in_memory()?.with_max_connections(max_connections as usize))
            } else if let Some(path) = url.strip_prefix("sqlite://") {
                Arc::new(SqliteGateway::open(path)?.with_max_connections(max_connections as usize))
            } else {
                return Err(Error::Config(
                    "database url must start with postgres://, postgresql:// or sqlite:".to_string(),
                ));
            };
        Ok(Self { gateway })
    }

    /// In-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteGateway::in_memory()?)))
    }

    /// Run `op` with one checked-out connection, then release it.
    ///
    /// The connection goes back whether `op` succeeds or fails. When the
    /// gateway has no connection to give, `op` never runs and the result
    /// is [`Error::ConnectionUnavailable`].
    pub async fn scoped<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut conn = match self.gateway.connection().await {
            Ok(Some(conn)) => conn,
            Ok(None) => {
                let err = Error::ConnectionUnavailable("gateway returned no connection".to_string());
                error!(error = %err, "can't query, invalid connection");
                return Err(err);
            }
            Err(e) => {
                let err = match e {
                    Error::ConnectionUnavailable(_) => e,
                    other => Error::ConnectionUnavailable(other.to_string()),
                };
                error!(error = %err, "can't query, failed to acquire connection");
                return Err(err);
            }
        };

        let result = op(conn.as_mut()).await;
        conn.release();
        result
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        self.scoped(|conn| Box::pin(async move { conn.query("SELECT 1", &[]).await.map(|_| ()) }))
            .await
    }
}

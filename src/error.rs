//! Error types for leasework.
//!
//! Lease contention and checkpoint misses are not errors: the store absorbs
//! them into boolean results. What remains here is what a caller must see.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The gateway handed out no connection. Nothing was acquired, so
    /// nothing is released.
    #[error("no database connection available: {0}")]
    ConnectionUnavailable(String),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("sqlite query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Programming error at the store/gateway boundary, e.g. a row that
    /// does not have the shape the statement promised.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors raised while running a statement, as opposed to
    /// failing to get a connection or misusing the gateway.
    pub fn is_query_failure(&self) -> bool {
        matches!(self, Error::Query(_) | Error::Sqlite(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

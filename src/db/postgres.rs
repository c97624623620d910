//! Postgres gateway over an sqlx connection pool.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo};
use tracing::warn;

use super::gateway::{Connection, Gateway, Row, Value};
use crate::error::{Error, Result};

pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Gateway for PgGateway {
    async fn connection(&self) -> Result<Option<Box<dyn Connection>>> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(Some(Box::new(PooledPg { conn }))),
            Err(sqlx::Error::PoolTimedOut) => {
                warn!("timed out waiting for a pooled postgres connection");
                Ok(None)
            }
            Err(e) => Err(Error::ConnectionUnavailable(e.to_string())),
        }
    }
}

struct PooledPg {
    conn: PoolConnection<Postgres>,
}

fn bind_all<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            Value::Null => query.bind(None::<i64>),
            Value::Int(n) => query.bind(*n),
            Value::Text(s) => query.bind(s.clone()),
        })
}

fn decode_row(row: &PgRow) -> Result<Row> {
    row.columns()
        .iter()
        .map(|col| {
            let i = col.ordinal();
            let value = match col.type_info().name() {
                "INT8" => row.try_get::<Option<i64>, _>(i)?.map(Value::Int),
                "INT4" => row
                    .try_get::<Option<i32>, _>(i)?
                    .map(|n| Value::Int(i64::from(n))),
                "INT2" => row
                    .try_get::<Option<i16>, _>(i)?
                    .map(|n| Value::Int(i64::from(n))),
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                    row.try_get::<Option<String>, _>(i)?.map(Value::Text)
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "column {} has unsupported type {other}",
                        col.name()
                    )));
                }
            };
            Ok(value.unwrap_or(Value::Null))
        })
        .collect()
}

#[async_trait]
impl Connection for PooledPg {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = bind_all(sql, params).fetch_all(&mut *self.conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let done = bind_all(sql, params).execute(&mut *self.conn).await?;
        Ok(done.rows_affected())
    }

    fn release(self: Box<Self>) {
        // PoolConnection returns itself to the pool on drop.
        drop(self.conn);
    }
}

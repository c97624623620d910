//! Shared fixtures: seeded databases, instrumented gateways and work handlers.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use leasework::db::Db;
use leasework::db::gateway::{Connection, Gateway, Row, Value};
use leasework::db::sqlite::SqliteGateway;
use leasework::engine::WorkHandler;
use leasework::error::{Error, Result};
use leasework::model::{OwnerId, WorkItem, WorkerId, partitions};

pub const PARTITIONS: u32 = 5;

/// In-memory database with the schema created and owners 1..=5 seeded.
pub async fn seeded_db() -> Db {
    let db = Db::in_memory().unwrap();
    db.setup_schema(&partitions(PARTITIONS)).await.unwrap();
    db
}

/// Same as [`seeded_db`], but with a handle on the gateway for inspection
/// and fault injection.
pub async fn counted_db() -> (Db, Arc<CountingGateway>) {
    let gateway = Arc::new(CountingGateway::new());
    let db = Db::new(gateway.clone());
    db.setup_schema(&partitions(PARTITIONS)).await.unwrap();
    (db, gateway)
}

// ---------------------------------------------------------------------------
// Gateways
// ---------------------------------------------------------------------------

/// A pool that never has a connection to give.
#[derive(Default)]
pub struct NullGateway {
    pub requests: AtomicUsize,
}

#[async_trait]
impl Gateway for NullGateway {
    async fn connection(&self) -> Result<Option<Box<dyn Connection>>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// A pool whose checkout itself fails.
#[derive(Default)]
pub struct RefusingGateway;

#[async_trait]
impl Gateway for RefusingGateway {
    async fn connection(&self) -> Result<Option<Box<dyn Connection>>> {
        Err(Error::Other("connection refused".to_string()))
    }
}

#[derive(Default)]
pub struct Tally {
    pub checkouts: AtomicUsize,
    pub releases: AtomicUsize,
    pub fail_execute: AtomicBool,
    pub fail_query: AtomicBool,
    pub garble_execute: AtomicBool,
}

/// SQLite gateway that counts checkouts and releases and can be told to
/// fail statements or break the gateway contract.
pub struct CountingGateway {
    inner: SqliteGateway,
    pub tally: Arc<Tally>,
}

impl CountingGateway {
    pub fn new() -> Self {
        Self {
            inner: SqliteGateway::in_memory().unwrap(),
            tally: Arc::default(),
        }
    }

    pub fn checkouts(&self) -> usize {
        self.tally.checkouts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.tally.releases.load(Ordering::SeqCst)
    }

    /// Connections checked out and not yet handed back.
    pub fn outstanding(&self) -> usize {
        self.checkouts() - self.releases()
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.idle_connections()
    }

    pub fn fail_execute(&self, on: bool) {
        self.tally.fail_execute.store(on, Ordering::SeqCst);
    }

    pub fn fail_query(&self, on: bool) {
        self.tally.fail_query.store(on, Ordering::SeqCst);
    }

    /// Make `execute` report a protocol violation instead of a row count.
    pub fn garble_execute(&self, on: bool) {
        self.tally.garble_execute.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl Gateway for CountingGateway {
    async fn connection(&self) -> Result<Option<Box<dyn Connection>>> {
        let Some(inner) = self.inner.connection().await? else {
            return Ok(None);
        };
        self.tally.checkouts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(CountingConnection {
            inner,
            tally: Arc::clone(&self.tally),
        })))
    }
}

fn statement_failure(message: &str) -> Error {
    Error::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
        Some(message.to_string()),
    ))
}

struct CountingConnection {
    inner: Box<dyn Connection>,
    tally: Arc<Tally>,
}

#[async_trait]
impl Connection for CountingConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.tally.fail_query.load(Ordering::SeqCst) {
            return Err(statement_failure("injected query failure"));
        }
        self.inner.query(sql, params).await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        if self.tally.fail_execute.load(Ordering::SeqCst) {
            return Err(statement_failure("injected execute failure"));
        }
        if self.tally.garble_execute.load(Ordering::SeqCst) {
            return Err(Error::Protocol("execute returned no row count".to_string()));
        }
        self.inner.execute(sql, params).await
    }

    fn release(self: Box<Self>) {
        let CountingConnection { inner, tally } = *self;
        tally.releases.fetch_add(1, Ordering::SeqCst);
        inner.release();
    }
}

// ---------------------------------------------------------------------------
// Work handlers
// ---------------------------------------------------------------------------

/// Records every item it sees; fails the ones listed in `fail_on`.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<i64>>,
    fail_on: HashSet<i64>,
}

impl RecordingHandler {
    pub fn failing_on(mod_times: impl IntoIterator<Item = i64>) -> Self {
        Self {
            seen: Mutex::default(),
            fail_on: mod_times.into_iter().collect(),
        }
    }

    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkHandler for RecordingHandler {
    async fn perform(&self, _owner: OwnerId, item: &WorkItem) -> Result<()> {
        self.seen.lock().unwrap().push(item.mod_time);
        if self.fail_on.contains(&item.mod_time) {
            return Err(Error::Other(format!("item {} failed", item.mod_time)));
        }
        Ok(())
    }
}

/// Records items like [`RecordingHandler`], but while performing the first
/// one it lets `rival` take the lease over at `at`.
pub struct RivalTakeover {
    db: Db,
    rival: WorkerId,
    at: i64,
    ttl: Duration,
    seen: Mutex<Vec<i64>>,
}

impl RivalTakeover {
    pub fn new(db: &Db, rival: &str, at: i64, ttl: Duration) -> Self {
        Self {
            db: db.clone(),
            rival: WorkerId::from(rival),
            at,
            ttl,
            seen: Mutex::default(),
        }
    }

    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkHandler for RivalTakeover {
    async fn perform(&self, owner: OwnerId, item: &WorkItem) -> Result<()> {
        let first = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(item.mod_time);
            seen.len() == 1
        };
        if first {
            let taken = self.db.acquire(&self.rival, owner, self.at, self.ttl).await?;
            assert!(taken, "rival could not take the lease at {}", self.at);
        }
        Ok(())
    }
}

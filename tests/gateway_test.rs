//! Connection scoping: every operation hands its connection back, and an
//! empty pool fails fast without releasing anything.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{NullGateway, RefusingGateway, counted_db};
use leasework::db::Db;
use leasework::db::sqlite::SqliteGateway;
use leasework::error::Error;
use leasework::model::{OwnerId, WorkerId};

const TTL: Duration = Duration::from_millis(60_000);

fn assert_unavailable<T: std::fmt::Debug>(result: leasework::error::Result<T>) {
    match result {
        Err(Error::ConnectionUnavailable(_)) => {}
        other => panic!("expected ConnectionUnavailable, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// No connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_pool_rejects_every_operation() {
    let gateway = Arc::new(NullGateway::default());
    let db = Db::new(gateway.clone());
    let w = WorkerId::from("w");
    let owner = OwnerId(1);

    assert_unavailable(db.setup_schema(&[owner]).await);
    assert_unavailable(db.acquire(&w, owner, 1_000, TTL).await);
    assert_unavailable(db.checkpoint(owner, &w, 10, 1_000).await);
    assert_unavailable(db.release(owner, &w, None).await);
    assert_unavailable(db.release(owner, &w, Some(10)).await);
    assert_unavailable(db.fetch_unprocessed(owner).await);
    assert_unavailable(db.append(owner, "p", 10).await);
    assert_unavailable(db.record_activity(&w, owner, 10).await);
    assert_unavailable(db.owners().await);
    assert_unavailable(db.owner(owner).await);
    assert_unavailable(db.activity(owner).await);
    assert_unavailable(db.duplicate_activity().await);
    assert_unavailable(db.health_check().await);

    assert_eq!(gateway.requests.load(Ordering::SeqCst), 13);
}

#[tokio::test]
async fn failed_checkout_is_connection_unavailable() {
    let db = Db::new(Arc::new(RefusingGateway));
    assert_unavailable(db.fetch_unprocessed(OwnerId(1)).await);
    assert_unavailable(db.acquire(&WorkerId::from("w"), OwnerId(1), 0, TTL).await);
}

#[tokio::test]
async fn exhausted_pool_times_out_as_unavailable() {
    let gateway = SqliteGateway::in_memory()
        .unwrap()
        .with_max_connections(0)
        .with_acquire_timeout(Duration::from_millis(20));
    let db = Db::new(Arc::new(gateway));
    assert_unavailable(db.health_check().await);
}

// ---------------------------------------------------------------------------
// Release on every exit path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_operations_release_their_connection() {
    let (db, gateway) = counted_db().await;
    let w = WorkerId::from("w");
    let owner = OwnerId(1);

    db.append(owner, "p", 10).await.unwrap();
    assert!(db.acquire(&w, owner, 1_000, TTL).await.unwrap());
    db.fetch_unprocessed(owner).await.unwrap();
    assert!(db.checkpoint(owner, &w, 10, 1_100).await.unwrap());
    assert!(db.record_activity(&w, owner, 10).await.unwrap());
    assert!(db.release(owner, &w, Some(10)).await.unwrap());
    db.owners().await.unwrap();

    assert!(gateway.checkouts() >= 8);
    assert_eq!(gateway.outstanding(), 0);
    assert_eq!(gateway.idle_connections(), 10);
}

#[tokio::test]
async fn business_failures_release_their_connection() {
    let (db, gateway) = counted_db().await;
    let (a, b) = (WorkerId::from("a"), WorkerId::from("b"));
    let owner = OwnerId(2);

    assert!(db.acquire(&a, owner, 1_000, TTL).await.unwrap());
    assert!(!db.acquire(&b, owner, 1_001, TTL).await.unwrap());
    assert!(!db.checkpoint(owner, &b, 10, 1_002).await.unwrap());
    assert!(!db.release(owner, &b, None).await.unwrap());
    assert!(!db.release(OwnerId(3), &a, None).await.unwrap());

    assert_eq!(gateway.outstanding(), 0);
}

#[tokio::test]
async fn lease_writes_absorb_query_failures() {
    let (db, gateway) = counted_db().await;
    let w = WorkerId::from("w");
    let owner = OwnerId(1);
    gateway.fail_execute(true);

    assert!(!db.acquire(&w, owner, 1_000, TTL).await.unwrap());
    assert!(!db.checkpoint(owner, &w, 10, 1_000).await.unwrap());
    assert!(!db.release(owner, &w, None).await.unwrap());
    assert!(!db.record_activity(&w, owner, 10).await.unwrap());

    assert_eq!(gateway.outstanding(), 0);
}

#[tokio::test]
async fn lease_writes_pass_protocol_violations_up() {
    let (db, gateway) = counted_db().await;
    let w = WorkerId::from("w");
    let owner = OwnerId(1);
    gateway.garble_execute(true);

    let is_protocol = |r: leasework::error::Result<bool>| matches!(r, Err(Error::Protocol(_)));
    assert!(is_protocol(db.acquire(&w, owner, 1_000, TTL).await));
    assert!(is_protocol(db.checkpoint(owner, &w, 10, 1_000).await));
    assert!(is_protocol(db.release(owner, &w, None).await));
    assert!(is_protocol(db.release(owner, &w, Some(10)).await));
    assert!(is_protocol(db.record_activity(&w, owner, 10).await));
    gateway.garble_execute(false);

    assert_eq!(gateway.outstanding(), 0);
    assert!(db.owner(owner).await.unwrap().unwrap().lease().is_none());
}

#[tokio::test]
async fn reads_and_appends_propagate_query_failures() {
    let (db, gateway) = counted_db().await;
    let owner = OwnerId(1);

    gateway.fail_query(true);
    let err = db.fetch_unprocessed(owner).await.unwrap_err();
    assert!(err.is_query_failure());
    assert!(db.owners().await.is_err());
    gateway.fail_query(false);

    gateway.fail_execute(true);
    let err = db.append(owner, "p", 10).await.unwrap_err();
    assert!(err.is_query_failure());

    assert_eq!(gateway.outstanding(), 0);
    assert_eq!(gateway.idle_connections(), 10);
}

#[tokio::test]
async fn sql_errors_surface_as_sqlite_errors() {
    // No schema: every table is missing.
    let db = Db::in_memory().unwrap();
    let err = db.fetch_unprocessed(OwnerId(1)).await.unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)), "got {err:?}");
    assert!(!db.acquire(&WorkerId::from("w"), OwnerId(1), 0, TTL).await.unwrap());
}

#[tokio::test]
async fn unknown_url_scheme_is_config_error() {
    let err = Db::open("mysql://localhost/db", 5).await.err().unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn file_backed_handles_share_state() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());

    let first = Db::open(&url, 2).await.unwrap();
    first.setup_schema(&leasework::model::partitions(3)).await.unwrap();
    let second = Db::open(&url, 2).await.unwrap();
    second.setup_schema(&leasework::model::partitions(3)).await.unwrap();

    let (a, b) = (WorkerId::from("a"), WorkerId::from("b"));
    assert!(first.acquire(&a, OwnerId(1), 1_000, TTL).await.unwrap());
    assert!(!second.acquire(&b, OwnerId(1), 1_500, TTL).await.unwrap());
    assert_eq!(second.owners().await.unwrap().len(), 3);
}

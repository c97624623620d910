//! Lease operations on the owners table: acquire, checkpoint, release.
//!
//! Each is a single conditional UPDATE. Row-level update atomicity in the
//! backing store is the only mutual exclusion there is. Contention and
//! query failures come back as `Ok(false)`. A missing connection or a
//! gateway protocol violation is an error.

use std::time::Duration;

use tracing::{debug, warn};

use super::gateway::Value;
use crate::error::{Error, Result};
use crate::model::{OwnerId, WorkerId};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

const ACQUIRE: &str = "UPDATE owners
    SET lease_holder = $1, lease_acquired_at = $2
    WHERE owner_id = $3
      AND (lease_holder IS NULL OR $2 - lease_acquired_at > $4)";

const CHECKPOINT: &str = "UPDATE owners
    SET high_water_mark = CASE WHEN high_water_mark < $3 THEN $3 ELSE high_water_mark END,
        lease_acquired_at = $4
    WHERE owner_id = $1 AND lease_holder = $2";

const RELEASE: &str = "UPDATE owners
    SET lease_holder = NULL, lease_acquired_at = NULL
    WHERE owner_id = $1 AND lease_holder = $2";

const RELEASE_WITH_MARK: &str = "UPDATE owners
    SET lease_holder = NULL, lease_acquired_at = NULL,
        high_water_mark = CASE WHEN high_water_mark < $3 THEN $3 ELSE high_water_mark END
    WHERE owner_id = $1 AND lease_holder = $2";

/// How a checkpoint attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// The row matched: the mark is raised (or kept) and the lease renewed.
    Advanced,
    /// No row matched. `worker` no longer holds the lease.
    NotHeld,
    /// The statement failed. The lease may still be held.
    QueryFailed,
}

/// Absorb a statement failure into `fallback`, pass anything else up.
fn absorb<T>(e: Error, fallback: T) -> Result<T> {
    if e.is_query_failure() { Ok(fallback) } else { Err(e) }
}

impl super::Db {
    /// Take the lease on `owner` if it is free or its holder's lease is
    /// older than `lease_ttl` at `now`.
    ///
    /// Returns true iff this call took the lease.
    pub async fn acquire(
        &self,
        worker: &WorkerId,
        owner: OwnerId,
        now: i64,
        lease_ttl: Duration,
    ) -> Result<bool> {
        let params = vec![
            Value::from(worker.as_str()),
            Value::Int(now),
            Value::Int(owner.0),
            Value::Int(lease_ttl.as_millis() as i64),
        ];
        let worker = worker.clone();

        let acquired = self
            .scoped(move |conn| {
                Box::pin(async move {
                    match conn.execute(ACQUIRE, &params).await {
                        Ok(rows) => Ok(rows > 0),
                        Err(e) => {
                            // Update-based lock failures are expected under contention.
                            debug!(%worker, %owner, error = %e, "lease acquire query failed");
                            absorb(e, false)
                        }
                    }
                })
            })
            .await;

        let result = match &acquired {
            Ok(true) => "acquired",
            Ok(false) => "contended",
            Err(_) => "error",
        };
        metrics::lease_attempts().add(
            1,
            &[
                KeyValue::new("owner", owner.0),
                KeyValue::new("result", result),
            ],
        );
        acquired
    }

    /// Record progress through `item_mod_time` and renew the lease to `now`.
    ///
    /// Only the current holder can checkpoint. The high-water mark never
    /// moves backwards. Returns false when nothing was updated.
    pub async fn checkpoint(
        &self,
        owner: OwnerId,
        worker: &WorkerId,
        item_mod_time: i64,
        now: i64,
    ) -> Result<bool> {
        let status = self
            .checkpoint_status(owner, worker, item_mod_time, now)
            .await?;
        Ok(status == CheckpointStatus::Advanced)
    }

    /// [`Db::checkpoint`], telling a lost lease apart from a failed statement.
    pub async fn checkpoint_status(
        &self,
        owner: OwnerId,
        worker: &WorkerId,
        item_mod_time: i64,
        now: i64,
    ) -> Result<CheckpointStatus> {
        let params = vec![
            Value::Int(owner.0),
            Value::from(worker.as_str()),
            Value::Int(item_mod_time),
            Value::Int(now),
        ];
        let worker = worker.clone();

        let status = self
            .scoped(move |conn| {
                Box::pin(async move {
                    match conn.execute(CHECKPOINT, &params).await {
                        Ok(0) => {
                            warn!(
                                %worker, %owner, mod_time = item_mod_time,
                                "checkpoint matched no row, lease no longer held"
                            );
                            Ok(CheckpointStatus::NotHeld)
                        }
                        Ok(_) => Ok(CheckpointStatus::Advanced),
                        Err(e) => {
                            warn!(%worker, %owner, mod_time = item_mod_time, error = %e, "checkpoint query failed");
                            absorb(e, CheckpointStatus::QueryFailed)
                        }
                    }
                })
            })
            .await?;

        if status != CheckpointStatus::Advanced {
            metrics::checkpoint_misses().add(1, &[KeyValue::new("owner", owner.0)]);
        }
        Ok(status)
    }

    /// Give up the lease on `owner`, raising the high-water mark to
    /// `new_high_water_mark` when given.
    ///
    /// Only clears a lease `worker` still holds. A lease that already
    /// expired and moved on is a warning, reported as false.
    pub async fn release(
        &self,
        owner: OwnerId,
        worker: &WorkerId,
        new_high_water_mark: Option<i64>,
    ) -> Result<bool> {
        let mut params = vec![Value::Int(owner.0), Value::from(worker.as_str())];
        let sql = match new_high_water_mark {
            Some(mark) => {
                params.push(Value::Int(mark));
                RELEASE_WITH_MARK
            }
            None => RELEASE,
        };
        let worker = worker.clone();

        let released = self
            .scoped(move |conn| {
                Box::pin(async move {
                    match conn.execute(sql, &params).await {
                        Ok(0) => {
                            warn!(%worker, %owner, "lease was already released");
                            Ok(false)
                        }
                        Ok(_) => Ok(true),
                        Err(e) => {
                            debug!(%worker, %owner, error = %e, "lease release query failed");
                            absorb(e, false)
                        }
                    }
                })
            })
            .await?;

        metrics::lease_releases().add(
            1,
            &[
                KeyValue::new("owner", owner.0),
                KeyValue::new("result", if released { "released" } else { "missed" }),
            ],
        );
        Ok(released)
    }
}

//! Core data model.
//!
//! An owner is a partition with a lease and a high-water mark. Work items
//! hang off an owner, ordered by modification time. The activity log records
//! which worker processed which item.

use serde::{Deserialize, Serialize};

use crate::db::gateway::{Row, Value};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Partition identity. A small, fixed, pre-seeded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub i64);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// The fixed partition set `1..=count`.
pub fn partitions(count: u32) -> Vec<OwnerId> {
    (1..=i64::from(count)).map(OwnerId).collect()
}

/// Stable identity of a coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Resolve a worker identity: explicit configuration first, then the
    /// process-scoped value, then a millisecond timestamp.
    ///
    /// The timestamp fallback collides when two processes start in the same
    /// millisecond. Only use it for single-instance runs.
    pub fn resolve(explicit: Option<&str>, ambient: Option<&str>, now_ms: i64) -> Self {
        [explicit, ambient]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(|s| Self(s.to_string()))
            .unwrap_or_else(|| Self(now_ms.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Owner
// ---------------------------------------------------------------------------

/// One row of the owners table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub owner_id: OwnerId,
    /// Worker currently holding the lease. `Some` iff `lease_acquired_at` is.
    pub lease_holder: Option<WorkerId>,
    /// Lease start (or last renewal), milliseconds.
    pub lease_acquired_at: Option<i64>,
    /// `mod_time` of the most recently checkpointed item. Never decreases.
    pub high_water_mark: i64,
}

/// A held lease, as seen from the owners table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: WorkerId,
    pub acquired_at: i64,
}

impl Owner {
    /// The current lease, if one is held.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.lease_holder, self.lease_acquired_at) {
            (Some(holder), Some(acquired_at)) => Some(Lease {
                holder: holder.clone(),
                acquired_at,
            }),
            _ => None,
        }
    }

    pub(crate) fn from_row(row: Row) -> Result<Self> {
        let [owner_id, holder, acquired_at, hwm] = columns::<4>(row, "owners")?;
        Ok(Self {
            owner_id: OwnerId(int(owner_id, "owner_id")?),
            lease_holder: opt_text(holder, "lease_holder")?.map(WorkerId),
            lease_acquired_at: opt_int(acquired_at, "lease_acquired_at")?,
            high_water_mark: int(hwm, "high_water_mark")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work appended to an owner's backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub owner_id: OwnerId,
    /// Opaque to the queue.
    pub payload: String,
    /// Sort key and de-facto identity within the owner.
    pub mod_time: i64,
}

impl WorkItem {
    pub(crate) fn from_row(row: Row) -> Result<Self> {
        let [owner_id, payload, mod_time] = columns::<3>(row, "work_items")?;
        Ok(Self {
            owner_id: OwnerId(int(owner_id, "owner_id")?),
            payload: text(payload, "payload")?,
            mod_time: int(mod_time, "mod_time")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Activity Log
// ---------------------------------------------------------------------------

/// Durable proof that a worker processed an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityLogEntry {
    pub worker_id: WorkerId,
    pub owner_id: OwnerId,
    pub mod_time: i64,
}

impl ActivityLogEntry {
    pub(crate) fn from_row(row: Row) -> Result<Self> {
        let [worker_id, owner_id, mod_time] = columns::<3>(row, "activity_log")?;
        Ok(Self {
            worker_id: WorkerId(text(worker_id, "worker_id")?),
            owner_id: OwnerId(int(owner_id, "owner_id")?),
            mod_time: int(mod_time, "mod_time")?,
        })
    }
}

/// An item that the activity log shows was processed more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateActivity {
    pub owner_id: OwnerId,
    pub mod_time: i64,
    pub times_processed: i64,
}

impl DuplicateActivity {
    pub(crate) fn from_row(row: Row) -> Result<Self> {
        let [owner_id, mod_time, times] = columns::<3>(row, "activity_log")?;
        Ok(Self {
            owner_id: OwnerId(int(owner_id, "owner_id")?),
            mod_time: int(mod_time, "mod_time")?,
            times_processed: int(times, "times_processed")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn columns<const N: usize>(row: Row, table: &str) -> Result<[Value; N]> {
    let len = row.len();
    row.try_into()
        .map_err(|_| Error::Protocol(format!("{table} row has {len} columns, expected {N}")))
}

fn int(value: Value, column: &str) -> Result<i64> {
    opt_int(value, column)?.ok_or_else(|| Error::Protocol(format!("{column} is NULL")))
}

fn opt_int(value: Value, column: &str) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Int(n) => Ok(Some(n)),
        Value::Text(_) => Err(Error::Protocol(format!("{column}: expected integer, got text"))),
    }
}

fn text(value: Value, column: &str) -> Result<String> {
    opt_text(value, column)?.ok_or_else(|| Error::Protocol(format!("{column} is NULL")))
}

fn opt_text(value: Value, column: &str) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        Value::Int(_) => Err(Error::Protocol(format!("{column}: expected text, got integer"))),
    }
}

//! Work item and activity log operations, plus read-only inspection.

use tracing::debug;

use super::gateway::Value;
use crate::error::Result;
use crate::model::{ActivityLogEntry, DuplicateActivity, Owner, OwnerId, WorkItem, WorkerId};

const FETCH_UNPROCESSED: &str = "SELECT w.owner_id, w.payload, w.mod_time
    FROM work_items w
    JOIN owners o ON o.owner_id = w.owner_id
    WHERE w.owner_id = $1 AND w.mod_time > o.high_water_mark
    ORDER BY w.mod_time ASC";

const APPEND: &str = "INSERT INTO work_items (owner_id, payload, mod_time) VALUES ($1, $2, $3)";

const RECORD_ACTIVITY: &str =
    "INSERT INTO activity_log (worker_id, owner_id, mod_time) VALUES ($1, $2, $3)";

const LIST_OWNERS: &str = "SELECT owner_id, lease_holder, lease_acquired_at, high_water_mark
    FROM owners ORDER BY owner_id";

const LIST_ACTIVITY: &str = "SELECT worker_id, owner_id, mod_time
    FROM activity_log WHERE owner_id = $1 ORDER BY mod_time";

const DUPLICATE_ACTIVITY: &str = "SELECT owner_id, mod_time, count(*) AS times_processed
    FROM activity_log
    GROUP BY owner_id, mod_time
    HAVING count(*) > 1
    ORDER BY owner_id, mod_time";

impl super::Db {
    /// All items for `owner` newer than its high-water mark, oldest first.
    pub async fn fetch_unprocessed(&self, owner: OwnerId) -> Result<Vec<WorkItem>> {
        self.scoped(move |conn| {
            Box::pin(async move {
                let rows = conn.query(FETCH_UNPROCESSED, &[Value::Int(owner.0)]).await?;
                rows.into_iter().map(WorkItem::from_row).collect()
            })
        })
        .await
    }

    /// Append a work item. No dedup: `mod_time` must be unique per owner.
    pub async fn append(&self, owner: OwnerId, payload: &str, mod_time: i64) -> Result<()> {
        let params = vec![Value::Int(owner.0), Value::from(payload), Value::Int(mod_time)];
        self.scoped(move |conn| {
            Box::pin(async move {
                conn.execute(APPEND, &params).await?;
                Ok(())
            })
        })
        .await
    }

    /// Log that `worker` processed the item at `item_mod_time`.
    ///
    /// Best effort: a failed insert is reported as false.
    pub async fn record_activity(
        &self,
        worker: &WorkerId,
        owner: OwnerId,
        item_mod_time: i64,
    ) -> Result<bool> {
        let params = vec![
            Value::from(worker.as_str()),
            Value::Int(owner.0),
            Value::Int(item_mod_time),
        ];
        self.scoped(move |conn| {
            Box::pin(async move {
                match conn.execute(RECORD_ACTIVITY, &params).await {
                    Ok(rows) => Ok(rows > 0),
                    Err(e) => {
                        debug!(%owner, mod_time = item_mod_time, error = %e, "activity insert failed");
                        if e.is_query_failure() { Ok(false) } else { Err(e) }
                    }
                }
            })
        })
        .await
    }

    /// Every owner row, by id.
    pub async fn owners(&self) -> Result<Vec<Owner>> {
        self.scoped(|conn| {
            Box::pin(async move {
                let rows = conn.query(LIST_OWNERS, &[]).await?;
                rows.into_iter().map(Owner::from_row).collect()
            })
        })
        .await
    }

    /// A single owner row, if seeded.
    pub async fn owner(&self, owner: OwnerId) -> Result<Option<Owner>> {
        Ok(self.owners().await?.into_iter().find(|o| o.owner_id == owner))
    }

    /// Activity log entries for `owner`, by item time.
    pub async fn activity(&self, owner: OwnerId) -> Result<Vec<ActivityLogEntry>> {
        self.scoped(move |conn| {
            Box::pin(async move {
                let rows = conn.query(LIST_ACTIVITY, &[Value::Int(owner.0)]).await?;
                rows.into_iter().map(ActivityLogEntry::from_row).collect()
            })
        })
        .await
    }

    /// Items the activity log shows were processed more than once.
    pub async fn duplicate_activity(&self) -> Result<Vec<DuplicateActivity>> {
        self.scoped(|conn| {
            Box::pin(async move {
                let rows = conn.query(DUPLICATE_ACTIVITY, &[]).await?;
                rows.into_iter().map(DuplicateActivity::from_row).collect()
            })
        })
        .await
    }
}

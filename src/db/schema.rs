//! Schema bootstrap: tables, index and the seeded partition set.
//!
//! The DDL sticks to what Postgres and SQLite both accept.

use tracing::info;

use super::gateway::Value;
use crate::error::{Error, Result};
use crate::model::OwnerId;

const CREATE_WORK_ITEMS: &str = "CREATE TABLE IF NOT EXISTS work_items (
    owner_id  BIGINT NOT NULL,
    payload   TEXT   NOT NULL,
    mod_time  BIGINT NOT NULL
)";

const CREATE_WORK_ITEMS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_work_items_owner ON work_items (owner_id, mod_time)";

const CREATE_ACTIVITY_LOG: &str = "CREATE TABLE IF NOT EXISTS activity_log (
    worker_id  TEXT   NOT NULL,
    owner_id   BIGINT NOT NULL,
    mod_time   BIGINT NOT NULL
)";

const CREATE_OWNERS: &str = "CREATE TABLE IF NOT EXISTS owners (
    owner_id           BIGINT PRIMARY KEY,
    lease_holder       TEXT,
    lease_acquired_at  BIGINT,
    high_water_mark    BIGINT NOT NULL DEFAULT 0
)";

const COUNT_OWNERS: &str = "SELECT count(*) FROM owners";

const SEED_OWNER: &str = "INSERT INTO owners (owner_id, lease_holder, lease_acquired_at, high_water_mark)
     VALUES ($1, NULL, NULL, 0)
     ON CONFLICT (owner_id) DO NOTHING";

impl super::Db {
    /// Create the tables if absent and seed `partitions` into an empty
    /// owners table. Safe to run on every start.
    pub async fn setup_schema(&self, partitions: &[OwnerId]) -> Result<()> {
        let partitions = partitions.to_vec();
        self.scoped(move |conn| {
            Box::pin(async move {
                for ddl in [
                    CREATE_WORK_ITEMS,
                    CREATE_WORK_ITEMS_INDEX,
                    CREATE_ACTIVITY_LOG,
                    CREATE_OWNERS,
                ] {
                    conn.execute(ddl, &[]).await?;
                }

                let rows = conn.query(COUNT_OWNERS, &[]).await?;
                let count = match rows.first().and_then(|row| row.first()) {
                    Some(Value::Int(n)) => *n,
                    other => {
                        return Err(Error::Protocol(format!(
                            "owner count returned {other:?}"
                        )));
                    }
                };

                if count == 0 {
                    for owner in &partitions {
                        conn.execute(SEED_OWNER, &[Value::Int(owner.0)]).await?;
                    }
                    info!(partitions = partitions.len(), "seeded owners table");
                } else {
                    info!(owners = count, "owners table already seeded");
                }
                Ok(())
            })
        })
        .await
    }
}

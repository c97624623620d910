//! Item producer: appends synthetic work items to random owners.
//!
//! Fire-and-forget. The producer never looks at leases and gets no
//! acknowledgement beyond the insert succeeding.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{error, info};
use uuid::Uuid;

use super::coordinator::PartitionSelector;
use crate::clock::Clock;
use crate::db::Db;
use crate::error::Result;
use crate::model::WorkItem;
use crate::telemetry::metrics;

/// Hands out item timestamps that are strictly increasing within this
/// process, even when the clock stalls or steps back.
///
/// Two producer processes can still mint the same value for one owner.
pub struct ModTimeSource {
    clock: Arc<dyn Clock>,
    last: AtomicI64,
}

impl ModTimeSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicI64::new(i64::MIN),
        }
    }

    /// `max(now, previous + 1)`.
    pub fn next(&self) -> i64 {
        let now = self.clock.now_ms();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Time between appended items.
    pub interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
        }
    }
}

pub struct Producer {
    db: Db,
    selector: Arc<dyn PartitionSelector>,
    stamps: ModTimeSource,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(
        db: Db,
        selector: Arc<dyn PartitionSelector>,
        clock: Arc<dyn Clock>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            db,
            selector,
            stamps: ModTimeSource::new(clock),
            config,
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Append one item with a random payload to a selected owner.
    pub async fn produce_one(&self) -> Result<WorkItem> {
        let item = WorkItem {
            owner_id: self.selector.select(),
            payload: Uuid::new_v4().to_string(),
            mod_time: self.stamps.next(),
        };
        self.db
            .append(item.owner_id, &item.payload, item.mod_time)
            .await?;

        metrics::items_produced().add(1, &[KeyValue::new("owner", item.owner_id.0)]);
        info!(
            owner = %item.owner_id,
            payload = %item.payload,
            mod_time = item.mod_time,
            "inserted work item"
        );
        Ok(item)
    }

    /// Scheduler callback: produce one item, log any failure.
    pub async fn tick(&self) {
        if let Err(e) = self.produce_one().await {
            error!(error = %e, "failed to produce work item");
        }
    }
}

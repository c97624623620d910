//! Work dispatcher: drains one owner's backlog while its lease is held.
//!
//! Items run strictly one after another in `mod_time` order. Each item is
//! checkpointed before the next starts, so the high-water mark only ever
//! covers fully processed items. A checkpoint that finds the lease gone
//! ends the drain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use rand::Rng;
use tracing::{Instrument, debug, info, warn};

use crate::clock::Clock;
use crate::db::Db;
use crate::db::lease::CheckpointStatus;
use crate::error::Result;
use crate::model::{OwnerId, WorkItem, WorkerId};
use crate::telemetry::{lease::drain_span, metrics};

/// Executes the work an item stands for.
///
/// May run again for the same item after a crash, so it should be
/// idempotent.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn perform(&self, owner: OwnerId, item: &WorkItem) -> Result<()>;
}

/// Pretends to do work by sleeping.
#[derive(Debug, Clone, Default)]
pub struct SimulatedWork {
    duration: Option<Duration>,
}

impl SimulatedWork {
    /// Sleep for `duration` per item, or a random 500 to 800 ms when `None`.
    pub fn new(duration: Option<Duration>) -> Self {
        Self { duration }
    }

    fn pause(&self) -> Duration {
        self.duration
            .unwrap_or_else(|| Duration::from_millis(rand::rng().random_range(500..=800)))
    }
}

#[async_trait]
impl WorkHandler for SimulatedWork {
    async fn perform(&self, _owner: OwnerId, _item: &WorkItem) -> Result<()> {
        let pause = self.pause();
        tokio::time::sleep(pause).await;
        Ok(())
    }
}

/// What happened to one item during a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Work done and checkpointed.
    Succeeded,
    /// Not checkpointed; the item stays eligible for the next lease cycle.
    FailedRetryable { reason: String },
    /// Work done, but the lease had passed to another worker by the
    /// checkpoint. Nothing after this item is performed.
    LeaseLost,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded)
    }

    fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Succeeded => "succeeded",
            ItemOutcome::FailedRetryable { .. } => "failed",
            ItemOutcome::LeaseLost => "lease_lost",
        }
    }
}

/// Result of draining one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// `(mod_time, outcome)` in processing order.
    pub outcomes: Vec<(i64, ItemOutcome)>,
    /// Last successfully checkpointed `mod_time`, if any.
    pub high_water_mark: Option<i64>,
}

impl DrainReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Whether the drain stopped early because the lease was taken over.
    pub fn lease_lost(&self) -> bool {
        matches!(self.outcomes.last(), Some((_, ItemOutcome::LeaseLost)))
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Db,
    handler: Arc<dyn WorkHandler>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(db: Db, handler: Arc<dyn WorkHandler>, clock: Arc<dyn Clock>) -> Self {
        Self { db, handler, clock }
    }

    /// Process every unprocessed item for `owner`, oldest first.
    ///
    /// A failing item is logged and skipped; the drain carries on. A
    /// checkpoint that finds the lease held elsewhere stops the drain before
    /// the next item. Only a failure to fetch the backlog fails the drain.
    pub async fn drain(&self, owner: OwnerId, worker: &WorkerId) -> Result<DrainReport> {
        let span = drain_span(owner, worker);
        async {
            let started = Instant::now();
            let items = self.db.fetch_unprocessed(owner).await?;
            if items.is_empty() {
                debug!("backlog empty");
                return Ok(DrainReport::default());
            }
            info!(items = items.len(), "draining backlog");

            let mut report = DrainReport::default();
            for item in &items {
                let outcome = self.process(owner, worker, item).await;
                if outcome.is_success() {
                    report.high_water_mark = Some(item.mod_time);
                }
                metrics::items_processed().add(
                    1,
                    &[
                        KeyValue::new("owner", owner.0),
                        KeyValue::new("result", outcome.label()),
                    ],
                );
                report.outcomes.push((item.mod_time, outcome));
                if report.lease_lost() {
                    warn!(
                        mod_time = item.mod_time,
                        remaining = items.len() - report.outcomes.len(),
                        "lease lost, abandoning drain"
                    );
                    break;
                }
            }

            metrics::drain_duration_ms().record(
                started.elapsed().as_millis() as f64,
                &[KeyValue::new("owner", owner.0)],
            );
            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                lease_lost = report.lease_lost(),
                high_water_mark = ?report.high_water_mark,
                "drain finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Perform, checkpoint, then log activity for one item.
    async fn process(&self, owner: OwnerId, worker: &WorkerId, item: &WorkItem) -> ItemOutcome {
        if let Err(e) = self.handler.perform(owner, item).await {
            warn!(mod_time = item.mod_time, error = %e, "work item failed");
            return ItemOutcome::FailedRetryable {
                reason: e.to_string(),
            };
        }

        let now = self.clock.now_ms();
        match self.db.checkpoint_status(owner, worker, item.mod_time, now).await {
            Ok(CheckpointStatus::Advanced) => {}
            Ok(CheckpointStatus::NotHeld) => return ItemOutcome::LeaseLost,
            Ok(CheckpointStatus::QueryFailed) => {
                return ItemOutcome::FailedRetryable {
                    reason: "checkpoint query failed".to_string(),
                };
            }
            Err(e) => {
                warn!(mod_time = item.mod_time, error = %e, "checkpoint failed");
                return ItemOutcome::FailedRetryable {
                    reason: e.to_string(),
                };
            }
        }

        // The activity log is telemetry; losing an entry does not undo the work.
        match self.db.record_activity(worker, owner, item.mod_time).await {
            Ok(true) => {}
            Ok(false) => warn!(mod_time = item.mod_time, "activity log entry not written"),
            Err(e) => warn!(mod_time = item.mod_time, error = %e, "activity log entry not written"),
        }

        debug!(
            mod_time = item.mod_time,
            payload = %item.payload,
            "processed work item"
        );
        ItemOutcome::Succeeded
    }
}

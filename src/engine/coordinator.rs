//! Lease coordinator: each tick picks an owner, tries its lease, drains it
//! on success and releases.
//!
//! Coordinators never talk to each other. The conditional UPDATE behind
//! [`Db::acquire`] decides who wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::{Instrument, error, info, warn};

use super::dispatch::{Dispatcher, DrainReport};
use crate::clock::Clock;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{OwnerId, WorkerId};
use crate::telemetry::lease::{record_phase, tick_span};

// ---------------------------------------------------------------------------
// Partition selection
// ---------------------------------------------------------------------------

/// Chooses which owner a tick goes after.
pub trait PartitionSelector: Send + Sync {
    fn select(&self) -> OwnerId;
}

/// Uniform random choice. No affinity, no rebalancing.
#[derive(Debug, Clone)]
pub struct RandomSelector {
    partitions: Vec<OwnerId>,
}

impl RandomSelector {
    pub fn new(partitions: Vec<OwnerId>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::Config("partition set is empty".to_string()));
        }
        Ok(Self { partitions })
    }
}

impl PartitionSelector for RandomSelector {
    fn select(&self) -> OwnerId {
        let i = rand::rng().random_range(0..self.partitions.len());
        self.partitions[i]
    }
}

/// Cycles through the partitions in order.
#[derive(Debug)]
pub struct RoundRobin {
    partitions: Vec<OwnerId>,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new(partitions: Vec<OwnerId>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::Config("partition set is empty".to_string()));
        }
        Ok(Self {
            partitions,
            next: AtomicUsize::new(0),
        })
    }
}

impl PartitionSelector for RoundRobin {
    fn select(&self) -> OwnerId {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.partitions[i % self.partitions.len()]
    }
}

/// Always the same owner.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub OwnerId);

impl PartitionSelector for FixedSelector {
    fn select(&self) -> OwnerId {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Tick state machine
// ---------------------------------------------------------------------------

/// Where a tick is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SelectOwner,
    Acquiring,
    Acquired,
    NotAcquired,
    Draining,
    Releasing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::SelectOwner => "select_owner",
            Phase::Acquiring => "acquiring",
            Phase::Acquired => "acquired",
            Phase::NotAcquired => "not_acquired",
            Phase::Draining => "draining",
            Phase::Releasing => "releasing",
        };
        f.write_str(s)
    }
}

/// How a tick ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Someone else holds the lease.
    NotAcquired { owner: OwnerId },
    /// The acquire itself errored (e.g. no connection).
    AcquireFailed { owner: OwnerId, error: String },
    Drained {
        owner: OwnerId,
        report: DrainReport,
        released: bool,
    },
    /// The backlog could not be fetched. The lease was still released.
    DrainFailed {
        owner: OwnerId,
        error: String,
        released: bool,
    },
}

impl TickOutcome {
    pub fn owner(&self) -> OwnerId {
        match self {
            TickOutcome::NotAcquired { owner }
            | TickOutcome::AcquireFailed { owner, .. }
            | TickOutcome::Drained { owner, .. }
            | TickOutcome::DrainFailed { owner, .. } => *owner,
        }
    }

    pub fn acquired(&self) -> bool {
        matches!(
            self,
            TickOutcome::Drained { .. } | TickOutcome::DrainFailed { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Configuration for one coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker_id: WorkerId,
    /// A lease older than this may be taken over.
    pub lease_ttl: Duration,
    /// Time between tick starts.
    pub tick_interval: Duration,
}

impl CoordinatorConfig {
    pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            lease_ttl: Self::DEFAULT_LEASE_TTL,
            tick_interval: Self::DEFAULT_TICK_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    db: Db,
    dispatcher: Dispatcher,
    selector: Arc<dyn PartitionSelector>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        db: Db,
        dispatcher: Dispatcher,
        selector: Arc<dyn PartitionSelector>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            selector,
            clock,
            config,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// One pass: select, acquire, and if acquired drain then release.
    pub async fn tick(&self) -> TickOutcome {
        let worker = &self.config.worker_id;
        let span = tick_span(worker);

        async {
            record_phase(Phase::Idle, Phase::SelectOwner);
            let owner = self.selector.select();
            tracing::Span::current().record("lease.owner", owner.0);

            record_phase(Phase::SelectOwner, Phase::Acquiring);
            let now = self.clock.now_ms();
            match self.db.acquire(worker, owner, now, self.config.lease_ttl).await {
                Ok(true) => {
                    record_phase(Phase::Acquiring, Phase::Acquired);
                    info!(%worker, %owner, "locked owner");
                }
                Ok(false) => {
                    record_phase(Phase::Acquiring, Phase::NotAcquired);
                    info!(%worker, %owner, "failed to lock owner");
                    record_phase(Phase::NotAcquired, Phase::Idle);
                    return TickOutcome::NotAcquired { owner };
                }
                Err(e) => {
                    error!(%worker, %owner, error = %e, "error while locking owner");
                    record_phase(Phase::Acquiring, Phase::Idle);
                    return TickOutcome::AcquireFailed {
                        owner,
                        error: e.to_string(),
                    };
                }
            }

            record_phase(Phase::Acquired, Phase::Draining);
            let drained = self.dispatcher.drain(owner, worker).await;

            record_phase(Phase::Draining, Phase::Releasing);
            let mark = drained.as_ref().ok().and_then(|r| r.high_water_mark);
            let released = self.release(owner, mark).await;
            record_phase(Phase::Releasing, Phase::Idle);

            match drained {
                Ok(report) => TickOutcome::Drained {
                    owner,
                    report,
                    released,
                },
                Err(e) => {
                    error!(%worker, %owner, error = %e, "drain failed");
                    TickOutcome::DrainFailed {
                        owner,
                        error: e.to_string(),
                        released,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Best-effort release; never fails the tick.
    async fn release(&self, owner: OwnerId, mark: Option<i64>) -> bool {
        let worker = &self.config.worker_id;
        match self.db.release(owner, worker, mark).await {
            Ok(true) => {
                info!(%worker, %owner, "unlocked owner");
                true
            }
            Ok(false) => {
                warn!(%worker, %owner, "failed to unlock owner");
                false
            }
            Err(e) => {
                error!(%worker, %owner, error = %e, "error while unlocking owner");
                false
            }
        }
    }
}

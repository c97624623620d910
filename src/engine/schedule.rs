//! Periodic task runner.
//!
//! `schedule` invokes a callback at a fixed interval on the tokio clock.
//! One invocation per task is in flight at a time; a slow callback delays
//! the next tick rather than stacking calls.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// Run `callback` every `interval` until [`Scheduler::shutdown`].
    ///
    /// The first invocation happens immediately.
    pub fn schedule<F, Fut>(&mut self, task_id: impl Into<String>, interval: Duration, mut callback: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_id = task_id.into();
        let mut stop = self.shutdown.subscribe();

        self.tasks.spawn(async move {
            debug!(task = %task_id, interval_ms = interval.as_millis() as u64, "task scheduled");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => callback().await,
                }
            }
            debug!(task = %task_id, "task stopped");
        });
    }

    /// Number of scheduled tasks still running.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every task to stop and wait for them. In-flight callbacks
    /// finish first.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "scheduled task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

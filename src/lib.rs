//! # leasework
//!
//! Lease-based distributed work queue.
//!
//! Worker processes compete for time-bounded leases on a fixed set of
//! partitions ("owners"). Whoever holds an owner's lease drains its backlog
//! in order, checkpointing a high-water mark after every item, then lets
//! the lease go. A conditional UPDATE in the database is the only lock.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;

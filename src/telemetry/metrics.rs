//! Metric instrument factories for leasework.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("leasework")
}

/// Counter: lease acquire attempts.
/// Labels: `owner`, `result` ("acquired" | "contended" | "error").
pub fn lease_attempts() -> Counter<u64> {
    meter()
        .u64_counter("leasework.lease.attempts")
        .with_description("Number of lease acquire attempts")
        .build()
}

/// Counter: lease releases.
/// Labels: `owner`, `result` ("released" | "missed").
pub fn lease_releases() -> Counter<u64> {
    meter()
        .u64_counter("leasework.lease.releases")
        .with_description("Number of lease release attempts")
        .build()
}

/// Counter: checkpoints that did not advance the high-water mark.
/// Labels: `owner`.
pub fn checkpoint_misses() -> Counter<u64> {
    meter()
        .u64_counter("leasework.checkpoint.misses")
        .with_description("Checkpoints that matched no lease")
        .build()
}

/// Counter: work items handled during drains.
/// Labels: `owner`, `result` ("succeeded" | "failed").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("leasework.items.processed")
        .with_description("Number of work items processed")
        .build()
}

/// Counter: work items appended by producers.
/// Labels: `owner`.
pub fn items_produced() -> Counter<u64> {
    meter()
        .u64_counter("leasework.items.produced")
        .with_description("Number of work items produced")
        .build()
}

/// Histogram: time to drain one owner, in milliseconds.
/// Labels: `owner`.
pub fn drain_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leasework.drain.duration_ms")
        .with_description("Backlog drain duration in milliseconds")
        .with_unit("ms")
        .build()
}

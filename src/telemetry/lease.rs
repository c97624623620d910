//! Lease tick and drain span helpers.

use tracing::Span;

use crate::engine::coordinator::Phase;
use crate::model::{OwnerId, WorkerId};

/// Start a span for one coordinator tick.
///
/// `lease.owner` is declared empty and filled in once an owner is selected.
pub fn tick_span(worker: &WorkerId) -> Span {
    tracing::info_span!(
        "lease.tick",
        "lease.worker" = %worker,
        "lease.owner" = tracing::field::Empty,
    )
}

/// Start a span for draining one owner's backlog.
pub fn drain_span(owner: OwnerId, worker: &WorkerId) -> Span {
    tracing::info_span!(
        "lease.drain",
        "lease.owner" = owner.0,
        "lease.worker" = %worker,
    )
}

/// Record a tick phase transition on the current span.
pub fn record_phase(from: Phase, to: Phase) {
    tracing::debug!(from = %from, to = %to, "phase_transition");
}

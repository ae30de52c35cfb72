//! Event dispatch span helpers.
//!
//! Provides span creation and outcome recording for events flowing from a
//! worker loop into a handler.

use chrono::Utc;
use tracing::Span;

use crate::model::{Event, WorkerId};

/// Start a span for one handler invocation.
///
/// The `event.outcome` field is declared empty and filled by
/// [`record_dispatch_outcome`]. `event.queued_ms` is how long the event
/// waited between creation and dispatch.
pub fn start_dispatch_span(event: &Event, worker: WorkerId) -> Span {
    let queued_ms = event.age(Utc::now()).as_millis() as u64;
    tracing::info_span!(
        "event.dispatch",
        "event.id" = %event.id,
        "event.uuid" = %event.uuid,
        "event.dispatch" = %event.dispatch,
        "event.binding_key" = event.binding_key.as_deref().unwrap_or("-"),
        "event.worker" = %worker,
        "event.queued_ms" = queued_ms,
        "event.outcome" = tracing::field::Empty,
    )
}

/// Record how the handler invocation ended on the given span.
pub fn record_dispatch_outcome(span: &Span, outcome: &str) {
    span.record("event.outcome", outcome);
}

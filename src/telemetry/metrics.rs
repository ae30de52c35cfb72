//! Metric instrument factories for nfp-controller.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"nfp-controller"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for nfp-controller instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("nfp-controller")
}

/// Counter: events submitted through `post_event`.
/// Labels: `event_id`, `dispatch`.
pub fn events_posted() -> Counter<u64> {
    meter()
        .u64_counter("nfp.events.posted")
        .with_description("Number of events posted to workers")
        .build()
}

/// Counter: events held back by the sequencer behind an in-flight sibling.
/// Labels: `event_id`.
pub fn events_sequenced() -> Counter<u64> {
    meter()
        .u64_counter("nfp.events.sequenced")
        .with_description("Number of events queued in the sequencer")
        .build()
}

/// Counter: events handed to a handler by a worker.
/// Labels: `event_id`, `dispatch`, `worker`.
pub fn events_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("nfp.events.dispatched")
        .with_description("Number of events dispatched to handlers")
        .build()
}

/// Counter: handler invocations that returned an error or panicked.
/// Labels: `event_id`, `dispatch`.
pub fn handler_failures() -> Counter<u64> {
    meter()
        .u64_counter("nfp.handler.failures")
        .with_description("Number of failed handler invocations")
        .build()
}

/// Counter: events with no registered handler.
/// Labels: `event_id`.
pub fn events_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("nfp.events.unroutable")
        .with_description("Events with no registered handler")
        .build()
}

/// Counter: poll clones forwarded for dispatch.
/// Labels: `event_id`.
pub fn poll_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("nfp.poll.dispatched")
        .with_description("Number of poll events whose spacing elapsed")
        .build()
}

/// Counter: poll events cancelled after exhausting their budget.
/// Labels: `event_id`.
pub fn poll_cancelled() -> Counter<u64> {
    meter()
        .u64_counter("nfp.poll.cancelled")
        .with_description("Number of poll events cancelled")
        .build()
}

/// Counter: entries rejected because the poll inbox was full.
/// Labels: `event_id`.
pub fn poll_inbox_rejected() -> Counter<u64> {
    meter()
        .u64_counter("nfp.poll.inbox_rejected")
        .with_description("Poll entries rejected by a full inbox")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `event_id`, `dispatch`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("nfp.handler.duration_ms")
        .with_description("Handler invocation duration in milliseconds")
        .with_unit("ms")
        .build()
}

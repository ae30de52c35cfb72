//! Core data model.
//!
//! An event is a unit of work routed through the controller to a handler.
//! It carries identity (id + optional poll key), an opaque payload, and the
//! routing metadata the controller uses for affinity, ordering and polling.

pub mod event;

pub use event::{DispatchKind, Event, WorkerId};

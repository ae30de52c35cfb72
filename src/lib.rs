//! # nfp-controller
//!
//! Event scheduling and worker-dispatch runtime for service function
//! appliances.
//!
//! Collaborators register event handlers and RPC agents with the
//! [`engine::Controller`], then post ordinary events or poll events. The
//! controller routes each event to a worker thread (with sticky affinity per
//! binding key), serializes related events, re-drives poll events on a
//! fixed tick, and reports agent state on another.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod module;
pub mod modules;
pub mod telemetry;

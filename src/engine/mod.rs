//! Event scheduling and worker dispatch: load balancing, sequencing, the
//! poll queue, the per-worker loop and the controller that ties them up.

pub mod balancer;
pub mod control;
pub mod poll;
pub mod sequencer;
pub mod worker;

pub use balancer::{LbPolicy, LoadBalancer, RoundRobin, StickyRoundRobin};
pub use control::{Controller, ControllerConfig, default_workers};
pub use poll::{PollEntry, PollQueueHandler, TickReport};
pub use sequencer::{EventSequencer, SequenceGroup, SequencerGuard, SequencerMap};
pub use worker::EventQueueHandler;

//! Periodic-task spacing for poll events.
//!
//! A handler declares, per event id, how far apart consecutive poll
//! dispatches must be and optionally a dedicated method to run instead of
//! its generic `handle_poll_event`. The table is filled explicitly in the
//! handler's constructor and consulted by the poll queue on every tick.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::Controller;
use crate::error::Result;
use crate::model::Event;

pub type PollFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// A dedicated poll method bound to one event id.
pub type PollMethod = Arc<dyn Fn(Controller, Event) -> PollFuture + Send + Sync>;

/// Outcome of checking a poll event's spacing at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spacing {
    /// Spacing elapsed: dispatch now.
    Due,
    /// First evaluation of a task that does not run immediately. The caller
    /// records `now` as the baseline.
    Baseline,
    /// Not yet; remaining idle time.
    Wait(Duration),
}

#[derive(Clone)]
pub struct PeriodicTask {
    pub spacing: Duration,
    pub run_immediately: bool,
    pub method: Option<PollMethod>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("spacing", &self.spacing)
            .field("run_immediately", &self.run_immediately)
            .field("method", &self.method.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PeriodicTask {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            run_immediately: false,
            method: None,
        }
    }

    pub fn run_immediately(mut self, run_immediately: bool) -> Self {
        self.run_immediately = run_immediately;
        self
    }

    /// Bind a dedicated poll method. It runs instead of `handle_poll_event`.
    pub fn method<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Controller, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.method = Some(Arc::new(move |controller, event| Box::pin(f(controller, event))));
        self
    }

    /// Time left before the spacing elapses. Zero when due.
    pub fn idle_for(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match last_run {
            None if self.run_immediately => Duration::ZERO,
            None => self.spacing,
            Some(last) => {
                // A clock step backwards counts as no time elapsed.
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                self.spacing.saturating_sub(elapsed)
            }
        }
    }

    pub fn evaluate(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Spacing {
        if last_run.is_none() && !self.run_immediately {
            return Spacing::Baseline;
        }
        match self.idle_for(last_run, now) {
            Duration::ZERO => Spacing::Due,
            remaining => Spacing::Wait(remaining),
        }
    }
}

/// Per-handler map of event id to periodic task.
#[derive(Debug, Clone, Default)]
pub struct PeriodicTable {
    tasks: HashMap<String, PeriodicTask>,
}

impl PeriodicTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, event_id: impl Into<String>, task: PeriodicTask) -> Self {
        self.insert(event_id, task);
        self
    }

    pub fn insert(&mut self, event_id: impl Into<String>, task: PeriodicTask) {
        self.tasks.insert(event_id.into(), task);
    }

    pub fn get(&self, event_id: &str) -> Option<&PeriodicTask> {
        self.tasks.get(event_id)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

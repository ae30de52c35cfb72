//! Worker selection policies.
//!
//! The worker set is fixed when the controller is built. Sticky bindings
//! live for the process lifetime and are never rebalanced, even if the
//! bound worker stops responding.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::WorkerId;

pub trait LoadBalancer: Send + Sync {
    /// Pick a worker for an optional affinity key.
    fn get(&self, key: Option<&str>) -> WorkerId;

    fn workers(&self) -> usize;
}

/// Policy name, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LbPolicy {
    RoundRobin,
    #[default]
    StickyRoundRobin,
}

impl LbPolicy {
    pub fn build(self, workers: usize) -> Box<dyn LoadBalancer> {
        match self {
            LbPolicy::RoundRobin => Box::new(RoundRobin::new(workers)),
            LbPolicy::StickyRoundRobin => Box::new(StickyRoundRobin::new(workers)),
        }
    }
}

impl FromStr for LbPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RoundRobin" | "round_robin" => Ok(LbPolicy::RoundRobin),
            "StickyRoundRobin" | "sticky_round_robin" => Ok(LbPolicy::StickyRoundRobin),
            other => Err(Error::Config(format!("unknown load balancer policy: {other}"))),
        }
    }
}

impl std::fmt::Display for LbPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LbPolicy::RoundRobin => "RoundRobin",
            LbPolicy::StickyRoundRobin => "StickyRoundRobin",
        };
        write!(f, "{s}")
    }
}

/// Cyclic selection, key ignored.
#[derive(Debug)]
pub struct RoundRobin {
    workers: usize,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "round robin needs at least one worker");
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    fn advance(&self) -> WorkerId {
        WorkerId(self.next.fetch_add(1, Ordering::Relaxed) % self.workers)
    }
}

impl LoadBalancer for RoundRobin {
    fn get(&self, _key: Option<&str>) -> WorkerId {
        self.advance()
    }

    fn workers(&self) -> usize {
        self.workers
    }
}

/// Round robin that remembers the worker chosen for each key.
#[derive(Debug)]
pub struct StickyRoundRobin {
    inner: RoundRobin,
    bindings: Mutex<HashMap<String, WorkerId>>,
}

impl StickyRoundRobin {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: RoundRobin::new(workers),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Worker a key is bound to, if it has been seen.
    pub fn bound(&self, key: &str) -> Option<WorkerId> {
        self.lock_bindings().get(key).copied()
    }

    fn lock_bindings(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerId>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LoadBalancer for StickyRoundRobin {
    fn get(&self, key: Option<&str>) -> WorkerId {
        let Some(key) = key else {
            return self.inner.advance();
        };
        *self
            .lock_bindings()
            .entry(key.to_string())
            .or_insert_with(|| self.inner.advance())
    }

    fn workers(&self) -> usize {
        self.inner.workers
    }
}

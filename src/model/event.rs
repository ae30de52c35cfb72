//! The event record and its routing metadata.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Index of a worker in the controller's fixed worker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Dispatch kind
// ---------------------------------------------------------------------------

/// How a worker should hand an event to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchKind {
    /// Ordinary dispatch via `handle_event`.
    #[default]
    Ordinary,
    /// One-shot clone of a poll event whose spacing elapsed.
    Poll,
    /// Poll event whose budget ran out; goes to `poll_event_cancel`.
    PollCancelled,
}

impl std::fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchKind::Ordinary => "ordinary",
            DispatchKind::Poll => "poll",
            DispatchKind::PollCancelled => "poll_cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A unit of work routed through the controller.
#[derive(Debug, Clone)]
pub struct Event {
    /// Instance identity. Poll clones keep the uuid of the event they were
    /// cloned from.
    pub uuid: Uuid,

    /// Logical operation (e.g. "CREATE_FIREWALL"). Selects the handler.
    pub id: String,

    /// Poll group key. All cached poll events sharing it are removed together.
    pub key: Option<String>,

    /// Opaque payload for the handler. The controller never interprets it.
    pub data: serde_json::Value,

    /// Affinity token. Events sharing it land on the same worker.
    pub binding_key: Option<String>,

    /// At most one event per (worker, binding_key) in flight when set.
    pub serialize: bool,

    pub dispatch: DispatchKind,

    /// Assigned once by the load balancer, never changed afterwards.
    pub worker_attached: Option<WorkerId>,

    /// Last time the periodic spacing of this poll event was satisfied.
    pub last_run: Option<DateTime<Utc>>,

    /// Remaining poll timeouts before auto-cancellation. None = unbounded.
    pub max_times: Option<u32>,

    /// When the event was built. Poll clones keep the original's.
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id: id.into(),
            key: None,
            data: serde_json::Value::Null,
            binding_key: None,
            serialize: false,
            dispatch: DispatchKind::Ordinary,
            worker_attached: None,
            last_run: None,
            max_times: None,
            created_at: Utc::now(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn binding_key(mut self, binding_key: impl Into<String>) -> Self {
        self.binding_key = Some(binding_key.into());
        self
    }

    pub fn serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    /// Pin the event to a worker up front instead of asking the load balancer.
    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.worker_attached = Some(worker);
        self
    }

    /// Group identity in the poll cache: the key, or the uuid if unkeyed.
    pub fn poll_group(&self) -> String {
        match self.key {
            Some(ref key) => key.clone(),
            None => self.uuid.to_string(),
        }
    }

    /// Whether the sequencer gates this event.
    pub fn is_sequenced(&self) -> bool {
        self.serialize && self.binding_key.is_some() && self.dispatch == DispatchKind::Ordinary
    }

    /// One-shot copy handed to the dispatch path. The clone is never
    /// re-entered into the poll cache.
    pub fn dispatch_clone(&self, dispatch: DispatchKind) -> Self {
        Self {
            dispatch,
            ..self.clone()
        }
    }

    /// Time since the event was built, as of `now`. Zero if the clock
    /// stepped backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// First 8 characters of the uuid, for logs.
    pub fn short_uuid(&self) -> String {
        self.uuid.to_string()[..8].to_string()
    }
}

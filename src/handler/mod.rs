//! Event handlers and the registry that binds event ids to them.
//!
//! A handler is collaborator-supplied code. The controller only knows the
//! callbacks below; which ones a handler implements decides which kinds of
//! dispatch it can receive.

pub mod periodic;

pub use periodic::{PeriodicTable, PeriodicTask, PollMethod, Spacing};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::Controller;
use crate::error::{Error, Result};
use crate::model::Event;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Ordinary dispatch. Serialized events must be released with
    /// [`Controller::event_done`] once the handler is finished with them.
    async fn handle_event(&self, controller: &Controller, event: Event) -> Result<()>;

    /// Generic poll dispatch, used when no dedicated periodic method is bound
    /// to the event id.
    async fn handle_poll_event(&self, _controller: &Controller, _event: Event) -> Result<()> {
        Err(Error::HookAbsent("handle_poll_event"))
    }

    /// Called with a fresh event once a poll event's budget is exhausted.
    async fn poll_event_cancel(&self, _controller: &Controller, _event: Event) -> Result<()> {
        Err(Error::HookAbsent("poll_event_cancel"))
    }

    /// Spacing and dedicated methods for poll events. Handlers without a
    /// table are polled on every tick.
    fn periodic_tasks(&self) -> Option<&PeriodicTable> {
        None
    }
}

/// Association of an event id with the handler responsible for it.
#[derive(Clone)]
pub struct EventDescriptor {
    pub id: String,
    pub handler: Arc<dyn EventHandler>,
}

impl EventDescriptor {
    pub fn new(id: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            id: id.into(),
            handler,
        }
    }
}

impl std::fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDescriptor").field("id", &self.id).finish()
    }
}

/// Registry of event handlers, indexed by event id.
///
/// Registration appends. Several handlers may be registered for one id, but
/// lookups always return the first registrant; later ones are retained and
/// never consulted.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: EventDescriptor) {
        self.handlers
            .entry(descriptor.id)
            .or_default()
            .push(descriptor.handler);
    }

    /// Look up the handler for an event id.
    pub fn get(&self, event_id: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .get(event_id)
            .and_then(|handlers| handlers.first())
            .cloned()
    }

    /// Periodic task the first registrant declares for this event id.
    pub fn periodic_task(&self, event_id: &str) -> Option<PeriodicTask> {
        let handlers = self.handlers.get(event_id)?;
        handlers
            .first()?
            .periodic_tasks()
            .and_then(|table| table.get(event_id))
            .cloned()
    }

    /// Number of handlers registered for an id, consulted or not.
    pub fn registrations(&self, event_id: &str) -> usize {
        self.handlers.get(event_id).map_or(0, Vec::len)
    }

    pub fn event_ids(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Tagged {
        tag: &'static str,
        periodic: PeriodicTable,
    }

    #[async_trait]
    impl EventHandler for Tagged {
        async fn handle_event(&self, _controller: &Controller, _event: Event) -> Result<()> {
            Err(Error::Handler(self.tag.to_string()))
        }

        fn periodic_tasks(&self) -> Option<&PeriodicTable> {
            Some(&self.periodic)
        }
    }

    fn tagged(tag: &'static str, spacing: u64) -> Arc<dyn EventHandler> {
        Arc::new(Tagged {
            tag,
            periodic: PeriodicTable::new()
                .with("CHECK", PeriodicTask::new(Duration::from_secs(spacing))),
        })
    }

    #[test]
    fn first_registrant_wins() {
        let mut registry = HandlerRegistry::empty();
        registry.register(EventDescriptor::new("CHECK", tagged("first", 1)));
        registry.register(EventDescriptor::new("CHECK", tagged("second", 9)));

        assert_eq!(registry.registrations("CHECK"), 2);
        let task = registry.periodic_task("CHECK").unwrap();
        assert_eq!(task.spacing, Duration::from_secs(1));
    }

    #[test]
    fn unregistered_id_has_no_handler() {
        let registry = HandlerRegistry::empty();
        assert!(registry.get("CREATE_VPN").is_none());
        assert!(registry.periodic_task("CREATE_VPN").is_none());
        assert_eq!(registry.registrations("CREATE_VPN"), 0);
    }

    #[test]
    fn periodic_task_only_for_declared_ids() {
        let mut registry = HandlerRegistry::empty();
        registry.register(EventDescriptor::new("SYNC", tagged("a", 1)));
        assert!(registry.get("SYNC").is_some());
        assert!(registry.periodic_task("SYNC").is_none());
    }
}

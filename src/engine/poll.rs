//! Poll queue: cache of poll-driven events, re-evaluated once per tick.
//!
//! Producers hand entries to a bounded inbox. Each tick admits a small batch
//! from the inbox into the cache, scans a window of the cache, and forwards
//! one-shot clones of the events whose spacing elapsed. Completion and
//! cancellation remove the whole group sharing the event's key.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, Spacing};
use crate::model::{DispatchKind, Event};
use crate::telemetry::metrics;

/// Entries admitted from the inbox per tick.
pub const POLL_FILL_BATCH: usize = 10;

/// Cache entries examined per tick.
pub const POLL_SCAN_BATCH: usize = 50;

#[derive(Debug, Clone)]
pub enum PollEntry {
    /// An event to keep polling.
    Active(Event),
    /// Completion marker: removes the event's group on the next scan.
    Done(Event),
}

impl PollEntry {
    pub fn event(&self) -> &Event {
        match self {
            PollEntry::Active(event) | PollEntry::Done(event) => event,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub admitted: usize,
    pub scanned: usize,
    pub dispatched: usize,
    pub cancelled: usize,
    pub removed: usize,
}

#[derive(Debug, Default)]
struct PollCache {
    entries: Vec<PollEntry>,
    cursor: usize,
}

pub struct PollQueueHandler {
    inbox_tx: mpsc::Sender<PollEntry>,
    inbox_rx: Mutex<mpsc::Receiver<PollEntry>>,
    cache: Mutex<PollCache>,
}

impl PollQueueHandler {
    pub fn new(inbox_capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity.max(1));
        Self {
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            cache: Mutex::new(PollCache::default()),
        }
    }

    /// Hand an entry to the inbox. A full inbox is reported, never awaited.
    pub fn add(&self, entry: PollEntry) -> Result<()> {
        match self.inbox_tx.try_send(entry) {
            Ok(()) => Ok(()),
            // The receiver lives in `self`, so the channel never closes.
            Err(TrySendError::Full(entry) | TrySendError::Closed(entry)) => {
                metrics::poll_inbox_rejected()
                    .add(1, &[KeyValue::new("event_id", entry.event().id.clone())]);
                warn!(event_id = %entry.event().id, "poll inbox full, entry rejected");
                Err(Error::PollInboxFull)
            }
        }
    }

    /// Move up to [`POLL_FILL_BATCH`] entries from the inbox into the cache.
    pub fn fill(&self) -> usize {
        let mut admitted = Vec::new();
        {
            let mut rx = self.inbox_rx.lock().unwrap_or_else(|e| e.into_inner());
            while admitted.len() < POLL_FILL_BATCH {
                match rx.try_recv() {
                    Ok(entry) => admitted.push(entry),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        let count = admitted.len();
        self.lock_cache().entries.extend(admitted);
        count
    }

    /// Non-destructive read of up to `count` cache entries from `index`.
    pub fn peek(&self, index: usize, count: usize) -> Vec<PollEntry> {
        let cache = self.lock_cache();
        let start = index.min(cache.entries.len());
        let end = start.saturating_add(count).min(cache.entries.len());
        cache.entries[start..end].to_vec()
    }

    /// Remove every cached entry in the event's group. Returns how many.
    pub fn remove(&self, event: &Event) -> usize {
        let group = event.poll_group();
        let mut cache = self.lock_cache();
        let PollCache { entries, cursor } = &mut *cache;

        let mut removed = 0;
        let mut index = 0;
        entries.retain(|entry| {
            let keep = entry.event().poll_group() != group;
            if !keep {
                removed += 1;
                if index < *cursor {
                    *cursor -= 1;
                }
            }
            index += 1;
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_cache().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One tick: admit, scan a window, forward due events through `post`.
    pub fn run<F>(&self, now: DateTime<Utc>, registry: &HandlerRegistry, mut post: F) -> TickReport
    where
        F: FnMut(Event) -> Result<()>,
    {
        let mut report = TickReport {
            admitted: self.fill(),
            ..TickReport::default()
        };

        let window = {
            let mut cache = self.lock_cache();
            if cache.cursor >= cache.entries.len() {
                cache.cursor = 0;
            }
            let start = cache.cursor;
            let end = (start + POLL_SCAN_BATCH).min(cache.entries.len());
            cache.cursor = end;
            cache.entries[start..end].to_vec()
        };

        for entry in window {
            report.scanned += 1;
            let event = match entry {
                PollEntry::Done(event) => {
                    report.removed += self.remove(&event);
                    debug!(event_id = %event.id, group = %event.poll_group(), "poll group done");
                    continue;
                }
                PollEntry::Active(event) => event,
            };

            let spacing = match registry.periodic_task(&event.id) {
                Some(task) => task.evaluate(event.last_run, now),
                None => Spacing::Due,
            };

            match spacing {
                Spacing::Due if event.max_times == Some(0) => {
                    let removed = self.remove(&event);
                    if removed == 0 {
                        // Group already went with an earlier entry of this window.
                        continue;
                    }
                    report.removed += removed;
                    report.cancelled += 1;
                    metrics::poll_cancelled().add(1, &[KeyValue::new("event_id", event.id.clone())]);
                    info!(
                        event_id = %event.id,
                        group = %event.poll_group(),
                        "poll budget exhausted, cancelling"
                    );
                    forward(&mut post, event.dispatch_clone(DispatchKind::PollCancelled));
                }
                Spacing::Due => {
                    let updated = self.update(event.uuid, |cached| {
                        cached.last_run = Some(now);
                        if let Some(remaining) = cached.max_times.as_mut() {
                            *remaining = remaining.saturating_sub(1);
                        }
                    });
                    let Some(updated) = updated else {
                        continue;
                    };
                    report.dispatched += 1;
                    metrics::poll_dispatched().add(1, &[KeyValue::new("event_id", event.id.clone())]);
                    forward(&mut post, updated.dispatch_clone(DispatchKind::Poll));
                }
                Spacing::Baseline => {
                    self.update(event.uuid, |cached| cached.last_run = Some(now));
                }
                Spacing::Wait(idle_for) => {
                    debug!(
                        event_id = %event.id,
                        idle_ms = idle_for.as_millis() as u64,
                        "poll event not due"
                    );
                }
            }
        }

        report
    }

    /// Apply `f` to the cached active event with this uuid and return a copy.
    fn update(&self, uuid: Uuid, f: impl FnOnce(&mut Event)) -> Option<Event> {
        let mut cache = self.lock_cache();
        let event = cache.entries.iter_mut().find_map(|entry| match entry {
            PollEntry::Active(event) if event.uuid == uuid => Some(event),
            _ => None,
        })?;
        f(event);
        Some(event.clone())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, PollCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn forward<F>(post: &mut F, event: Event)
where
    F: FnMut(Event) -> Result<()>,
{
    let event_id = event.id.clone();
    if let Err(e) = post(event) {
        warn!(event_id = %event_id, error = %e, "failed to forward poll event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Controller;
    use crate::handler::{EventDescriptor, EventHandler, PeriodicTable, PeriodicTask};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use std::time::Duration;

    struct Spaced(PeriodicTable);

    #[async_trait]
    impl EventHandler for Spaced {
        async fn handle_event(&self, _controller: &Controller, _event: Event) -> Result<()> {
            Ok(())
        }

        fn periodic_tasks(&self) -> Option<&PeriodicTable> {
            Some(&self.0)
        }
    }

    fn registry_with_spacing(event_id: &str, secs: u64) -> HandlerRegistry {
        let mut registry = HandlerRegistry::empty();
        let table = PeriodicTable::new().with(
            event_id,
            PeriodicTask::new(Duration::from_secs(secs)).run_immediately(true),
        );
        registry.register(EventDescriptor::new(event_id, Arc::new(Spaced(table))));
        registry
    }

    fn tick(poll: &PollQueueHandler, registry: &HandlerRegistry, now: DateTime<Utc>) -> Vec<Event> {
        let mut posted = Vec::new();
        poll.run(now, registry, |event| {
            posted.push(event);
            Ok(())
        });
        posted
    }

    fn active(event: Event, max_times: Option<u32>) -> PollEntry {
        PollEntry::Active(Event { max_times, ..event })
    }

    #[test]
    fn budget_of_two_dispatches_twice_then_cancels() {
        let poll = PollQueueHandler::new(16);
        let registry = HandlerRegistry::empty();
        poll.add(active(Event::new("CHECK").key("vm-1"), Some(2))).unwrap();
        let now = Utc::now();

        let first = tick(&poll, &registry, now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].dispatch, DispatchKind::Poll);
        assert_eq!(first[0].max_times, Some(1));

        let second = tick(&poll, &registry, now);
        assert_eq!(second[0].dispatch, DispatchKind::Poll);
        assert_eq!(second[0].max_times, Some(0));

        let third = tick(&poll, &registry, now);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].dispatch, DispatchKind::PollCancelled);
        assert!(poll.is_empty());

        assert!(tick(&poll, &registry, now).is_empty());
    }

    #[test]
    fn budget_only_spent_when_spacing_elapsed() {
        let poll = PollQueueHandler::new(16);
        let registry = registry_with_spacing("CHECK", 10);
        poll.add(active(Event::new("CHECK"), Some(1))).unwrap();
        let t0 = Utc::now();

        assert_eq!(tick(&poll, &registry, t0).len(), 1);
        for secs in 1..10 {
            assert!(tick(&poll, &registry, t0 + TimeDelta::seconds(secs)).is_empty());
        }
        assert_eq!(poll.len(), 1);

        let cancelled = tick(&poll, &registry, t0 + TimeDelta::seconds(10));
        assert_eq!(cancelled[0].dispatch, DispatchKind::PollCancelled);
    }

    #[test]
    fn remove_takes_out_whole_key_group() {
        let poll = PollQueueHandler::new(16);
        poll.add(active(Event::new("CHECK").key("k"), None)).unwrap();
        poll.add(active(Event::new("STATUS").key("k"), None)).unwrap();
        poll.add(active(Event::new("CHECK").key("other"), None)).unwrap();
        poll.fill();

        assert_eq!(poll.remove(&Event::new("ANY").key("k")), 2);
        let left = poll.peek(0, 10);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event().key.as_deref(), Some("other"));
    }

    #[test]
    fn done_marker_removes_group_on_next_tick() {
        let poll = PollQueueHandler::new(16);
        let registry = HandlerRegistry::empty();
        let event = Event::new("CHECK").key("vm-1");
        poll.add(active(event.clone(), None)).unwrap();
        assert_eq!(tick(&poll, &registry, Utc::now()).len(), 1);

        poll.add(PollEntry::Done(event)).unwrap();
        let report = poll.run(Utc::now(), &registry, |_| Ok(()));
        assert_eq!(report.removed, 2);
        assert!(poll.is_empty());
    }

    #[test]
    fn fill_admits_a_bounded_batch() {
        let poll = PollQueueHandler::new(64);
        for i in 0..25 {
            poll.add(active(Event::new("CHECK").key(format!("k{i}")), None)).unwrap();
        }
        assert_eq!(poll.fill(), POLL_FILL_BATCH);
        assert_eq!(poll.fill(), POLL_FILL_BATCH);
        assert_eq!(poll.fill(), 5);
        assert_eq!(poll.fill(), 0);
        assert_eq!(poll.len(), 25);
    }

    #[test]
    fn full_inbox_is_reported_not_fatal() {
        let poll = PollQueueHandler::new(1);
        poll.add(active(Event::new("CHECK"), None)).unwrap();
        assert!(matches!(
            poll.add(active(Event::new("CHECK"), None)),
            Err(Error::PollInboxFull)
        ));
        poll.fill();
        assert!(poll.add(active(Event::new("CHECK"), None)).is_ok());
    }

    #[test]
    fn peek_is_clamped_and_non_destructive() {
        let poll = PollQueueHandler::new(8);
        for i in 0..3 {
            poll.add(active(Event::new("CHECK").key(format!("k{i}")), None)).unwrap();
        }
        poll.fill();
        assert_eq!(poll.peek(1, 10).len(), 2);
        assert!(poll.peek(5, 10).is_empty());
        assert_eq!(poll.len(), 3);
    }

    #[test]
    fn baseline_tick_does_not_dispatch() {
        let mut registry = HandlerRegistry::empty();
        let table = PeriodicTable::new().with("CHECK", PeriodicTask::new(Duration::from_secs(5)));
        registry.register(EventDescriptor::new("CHECK", Arc::new(Spaced(table))));
        let poll = PollQueueHandler::new(8);
        poll.add(active(Event::new("CHECK"), Some(3))).unwrap();
        let t0 = Utc::now();

        assert!(tick(&poll, &registry, t0).is_empty());
        let due = tick(&poll, &registry, t0 + TimeDelta::seconds(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].max_times, Some(2));
    }

    #[test]
    fn large_cache_is_covered_across_ticks() {
        let poll = PollQueueHandler::new(256);
        let registry = HandlerRegistry::empty();
        for i in 0..(POLL_SCAN_BATCH + 10) {
            poll.add(active(Event::new("CHECK").key(format!("k{i}")), None)).unwrap();
        }
        while poll.fill() > 0 {}

        let first = tick(&poll, &registry, Utc::now());
        let second = tick(&poll, &registry, Utc::now());
        assert_eq!(first.len(), POLL_SCAN_BATCH);
        assert_eq!(second.len(), 10);
    }
}

//! Per-(worker, binding key) serialization of related events.
//!
//! The first serialized event of a group is dispatched immediately and the
//! group is marked in use. Siblings arriving while it is in flight are
//! queued FIFO. Releasing the in-flight event makes the head of the queue
//! ready; the owning worker pulls it with [`EventSequencer::next_ready`].
//! Groups with nothing in flight and nothing queued are deleted at once.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::model::{Event, WorkerId};

/// State of one (worker, binding key) group.
#[derive(Debug, Clone, Default)]
pub struct SequenceGroup {
    /// Uuid of the dispatched, not yet released event of this group.
    pub in_flight: Option<Uuid>,
    pub queue: VecDeque<Event>,
}

pub type SequencerMap = HashMap<WorkerId, HashMap<String, SequenceGroup>>;

/// Exclusive access to the sequencer map. Dropping it unlocks.
///
/// The lock is re-entrant: the holder may keep calling into the controller
/// (`post_event`, `event_done`) on the same thread. The map itself is only
/// borrowed for the duration of a [`read`](Self::read) or
/// [`write`](Self::write) closure, so do not call back into the controller
/// from inside one.
pub struct SequencerGuard<'a>(ReentrantMutexGuard<'a, RefCell<SequencerMap>>);

impl SequencerGuard<'_> {
    pub fn read<R>(&self, f: impl FnOnce(&SequencerMap) -> R) -> R {
        f(&self.0.borrow())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut SequencerMap) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

#[derive(Debug, Default)]
pub struct EventSequencer {
    map: ReentrantMutex<RefCell<SequencerMap>>,
}

fn slot(event: &Event) -> Option<(WorkerId, &str)> {
    Some((event.worker_attached?, event.binding_key.as_deref()?))
}

impl EventSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the coarse lock guarding the map.
    pub fn lock(&self) -> SequencerGuard<'_> {
        SequencerGuard(self.map.lock())
    }

    fn with<R>(&self, f: impl FnOnce(&mut SequencerMap) -> R) -> R {
        self.lock().write(f)
    }

    /// Admit a serialized event. Returns `true` if it was queued behind an
    /// in-flight sibling, `false` if the caller should dispatch it now.
    pub fn add(&self, event: &Event) -> bool {
        let Some((worker, binding_key)) = slot(event) else {
            return false;
        };
        self.with(|map| {
            let groups = map.entry(worker).or_default();
            match groups.get_mut(binding_key) {
                Some(group) => {
                    group.queue.push_back(event.clone());
                    debug!(
                        event_id = %event.id,
                        event_uuid = %event.short_uuid(),
                        %worker,
                        binding_key,
                        depth = group.queue.len(),
                        "event sequenced behind in-flight sibling"
                    );
                    true
                }
                None => {
                    groups.insert(
                        binding_key.to_string(),
                        SequenceGroup {
                            in_flight: Some(event.uuid),
                            queue: VecDeque::new(),
                        },
                    );
                    false
                }
            }
        })
    }

    /// Snapshot of the whole map for iteration outside the lock.
    pub fn copy(&self) -> SequencerMap {
        self.lock().read(SequencerMap::clone)
    }

    /// Drop a queued event from its group. Returns whether it was found.
    pub fn remove(&self, event: &Event) -> bool {
        let Some((worker, binding_key)) = slot(event) else {
            return false;
        };
        self.with(|map| {
            let Some(group) = map.get_mut(&worker).and_then(|g| g.get_mut(binding_key)) else {
                return false;
            };
            let before = group.queue.len();
            group.queue.retain(|queued| queued.uuid != event.uuid);
            let removed = group.queue.len() != before;
            gc(map, worker, binding_key);
            removed
        })
    }

    /// Release a finished event. Returns `true` if a queued sibling is now
    /// ready for the worker.
    ///
    /// Only the in-flight event frees its group. A still-queued event is
    /// dropped from the queue instead, and anything else (a repeated or
    /// stale release) changes nothing.
    pub fn release(&self, event: &Event) -> bool {
        let Some((worker, binding_key)) = slot(event) else {
            return false;
        };
        let released = self.with(|map| {
            let group = map.get_mut(&worker).and_then(|g| g.get_mut(binding_key))?;
            if group.in_flight != Some(event.uuid) {
                return Some(false);
            }
            group.in_flight = None;
            let ready = !group.queue.is_empty();
            gc(map, worker, binding_key);
            Some(ready)
        });
        match released {
            Some(true) => true,
            Some(false) if self.remove(event) => {
                debug!(
                    event_id = %event.id,
                    event_uuid = %event.short_uuid(),
                    %worker,
                    binding_key,
                    "queued event released before dispatch, dropped"
                );
                false
            }
            Some(false) => {
                debug!(
                    event_id = %event.id,
                    event_uuid = %event.short_uuid(),
                    %worker,
                    binding_key,
                    "stale release ignored"
                );
                false
            }
            None => false,
        }
    }

    /// Pop the next released sibling for a worker, marking it in flight.
    pub fn next_ready(&self, worker: WorkerId) -> Option<Event> {
        self.with(|map| {
            let groups = map.get_mut(&worker)?;
            groups
                .values_mut()
                .find(|group| group.in_flight.is_none() && !group.queue.is_empty())
                .and_then(|group| {
                    let event = group.queue.pop_front()?;
                    group.in_flight = Some(event.uuid);
                    Some(event)
                })
        })
    }

    /// Uuid of the group's dispatched and unreleased event, if any.
    pub fn in_flight(&self, worker: WorkerId, binding_key: &str) -> Option<Uuid> {
        self.lock().read(|map| {
            map.get(&worker)
                .and_then(|groups| groups.get(binding_key))
                .and_then(|group| group.in_flight)
        })
    }

    /// Number of events queued for a worker across all its groups.
    pub fn pending(&self, worker: WorkerId) -> usize {
        self.lock().read(|map| {
            map.get(&worker)
                .map_or(0, |groups| groups.values().map(|g| g.queue.len()).sum())
        })
    }
}

fn gc(map: &mut SequencerMap, worker: WorkerId, binding_key: &str) {
    let Some(groups) = map.get_mut(&worker) else {
        return;
    };
    if groups
        .get(binding_key)
        .is_some_and(|group| group.in_flight.is_none() && group.queue.is_empty())
    {
        groups.remove(binding_key);
    }
    if groups.is_empty() {
        map.remove(&worker);
    }
}

//! Per-worker event loop.
//!
//! Each worker thread drives one [`EventQueueHandler`] on a single-threaded
//! runtime. The loop takes released sequencer siblings first, then reads its
//! inbound queue with a short timeout, and spawns each handler invocation as
//! a local task bounded by a semaphore. Handler failures are logged and
//! contained here; they never reach the controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::control::Controller;
use crate::error::Error;
use crate::handler::{EventHandler, PollMethod};
use crate::model::{DispatchKind, Event, WorkerId};
use crate::telemetry::event::{record_dispatch_outcome, start_dispatch_span};
use crate::telemetry::metrics;

enum Next {
    Event(Event),
    Idle,
    Stop,
}

pub struct EventQueueHandler {
    worker: WorkerId,
    controller: Controller,
    inbound: mpsc::UnboundedReceiver<Event>,
    wake: Arc<Notify>,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<()>,
    /// Task id to (event id, event uuid), for reporting panics.
    running: HashMap<Id, (String, String)>,
    poll_timeout: Duration,
    shutdown_grace: Duration,
    shutdown: CancellationToken,
}

impl EventQueueHandler {
    pub fn new(
        worker: WorkerId,
        controller: Controller,
        inbound: mpsc::UnboundedReceiver<Event>,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        let config = controller.config();
        Self {
            worker,
            permits: Arc::new(Semaphore::new(config.worker_concurrency)),
            poll_timeout: config.queue_poll_timeout,
            shutdown_grace: config.shutdown_grace,
            controller,
            inbound,
            wake,
            in_flight: JoinSet::new(),
            running: HashMap::new(),
            shutdown,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Run until shutdown is signalled or the inbound queue closes.
    pub async fn run(mut self) {
        info!(worker = %self.worker, "worker started");
        loop {
            self.reap_finished();
            match self.next_event().await {
                Next::Event(event) => self.dispatch(event).await,
                Next::Idle => {}
                Next::Stop => break,
            }
            tokio::task::yield_now().await;
        }
        self.drain().await;
        info!(worker = %self.worker, "worker stopped");
    }

    async fn next_event(&mut self) -> Next {
        if self.shutdown.is_cancelled() {
            return Next::Stop;
        }
        if let Some(event) = self.controller.next_sequenced(self.worker) {
            return Next::Event(event);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Next::Stop,
            _ = self.wake.notified() => Next::Idle,
            received = tokio::time::timeout(self.poll_timeout, self.inbound.recv()) => match received {
                Ok(Some(event)) => Next::Event(event),
                Ok(None) => Next::Stop,
                Err(_) => Next::Idle,
            },
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let Some(handler) = self.controller.handler_for(&event.id) else {
            metrics::events_unroutable().add(1, &[KeyValue::new("event_id", event.id.clone())]);
            error!(
                worker = %self.worker,
                event_id = %event.id,
                event_uuid = %event.short_uuid(),
                "no handler registered for event, dropping"
            );
            return;
        };

        let method = match event.dispatch {
            DispatchKind::Poll => self
                .controller
                .periodic_task(&event.id)
                .and_then(|task| task.method),
            _ => None,
        };

        // Wait for a slot, but never past shutdown.
        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        metrics::events_dispatched().add(
            1,
            &[
                KeyValue::new("event_id", event.id.clone()),
                KeyValue::new("dispatch", event.dispatch.to_string()),
                KeyValue::new("worker", self.worker.to_string()),
            ],
        );

        debug!(
            worker = %self.worker,
            event_id = %event.id,
            event_uuid = %event.short_uuid(),
            dispatch = %event.dispatch,
            queued_ms = event.age(Utc::now()).as_millis() as u64,
            "dispatching event"
        );
        let identity = (event.id.clone(), event.short_uuid());
        let span = start_dispatch_span(&event, self.worker);
        let controller = self.controller.clone();
        let task = self.in_flight.spawn(
            async move {
                let _permit = permit;
                invoke(handler, method, controller, event).await;
            }
            .instrument(span),
        );
        self.running.insert(task.id(), identity);
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next_with_id() {
            self.reaped(joined);
        }
    }

    fn reaped(&mut self, joined: Result<(Id, ()), JoinError>) {
        match joined {
            Ok((id, ())) => {
                self.running.remove(&id);
            }
            Err(e) => {
                let (event_id, event_uuid) = self
                    .running
                    .remove(&e.id())
                    .unwrap_or_else(|| ("unknown".to_string(), "-".to_string()));
                if e.is_panic() {
                    metrics::handler_failures()
                        .add(1, &[KeyValue::new("event_id", event_id.clone())]);
                    error!(worker = %self.worker, %event_id, %event_uuid, "handler panicked");
                } else {
                    warn!(worker = %self.worker, %event_id, %event_uuid, "handler task cancelled");
                }
            }
        }
    }

    /// Give in-flight handlers the grace period, then abort the rest.
    async fn drain(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        debug!(worker = %self.worker, in_flight = self.in_flight.len(), "draining handlers");
        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        worker = %self.worker,
                        in_flight = self.in_flight.len(),
                        "grace period over, aborting handlers"
                    );
                    self.in_flight.shutdown().await;
                    return;
                }
                joined = self.in_flight.join_next_with_id() => match joined {
                    Some(joined) => self.reaped(joined),
                    None => return,
                },
            }
        }
    }
}

/// Call the handler entry point matching the dispatch kind and log the
/// outcome. Runs inside the dispatch span.
async fn invoke(
    handler: Arc<dyn EventHandler>,
    method: Option<PollMethod>,
    controller: Controller,
    event: Event,
) {
    let started = Instant::now();
    let dispatch = event.dispatch;
    let event_id = event.id.clone();
    let event_uuid = event.short_uuid();

    let result = match (dispatch, method) {
        (DispatchKind::Ordinary, _) => handler.handle_event(&controller, event).await,
        (DispatchKind::Poll, Some(method)) => method(controller.clone(), event).await,
        (DispatchKind::Poll, None) => handler.handle_poll_event(&controller, event).await,
        (DispatchKind::PollCancelled, _) => handler.poll_event_cancel(&controller, event).await,
    };

    let labels = [
        KeyValue::new("event_id", event_id.clone()),
        KeyValue::new("dispatch", dispatch.to_string()),
    ];
    metrics::handler_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);

    let span = Span::current();
    match result {
        Ok(()) => {
            record_dispatch_outcome(&span, "ok");
            debug!(%event_id, %event_uuid, %dispatch, "handler finished");
        }
        Err(Error::HookAbsent(hook)) if dispatch == DispatchKind::PollCancelled => {
            record_dispatch_outcome(&span, "skipped");
            info!(%event_id, %event_uuid, hook, "handler has no cancellation hook");
        }
        Err(e) => {
            record_dispatch_outcome(&span, "error");
            metrics::handler_failures().add(1, &labels);
            error!(%event_id, %event_uuid, %dispatch, error = %e, "handler failed");
        }
    }
}

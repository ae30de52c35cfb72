//! Controller: owns the workers, the sequencer, the poll queue and the
//! periodic timers, and is the only surface collaborators call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::balancer::{LbPolicy, LoadBalancer};
use super::poll::{PollEntry, PollQueueHandler, TickReport};
use super::sequencer::{EventSequencer, SequencerGuard};
use super::worker::EventQueueHandler;
use crate::agent::RpcAgent;
use crate::error::{Error, Result};
use crate::handler::{EventDescriptor, EventHandler, HandlerRegistry, PeriodicTask};
use crate::model::{DispatchKind, Event, WorkerId};
use crate::module::ServiceModule;
use crate::telemetry::metrics;

/// Configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of worker threads. Fixed once the controller is built.
    pub workers: usize,
    pub lb_policy: LbPolicy,
    /// Spacing between poll-queue ticks.
    pub poll_interval: Duration,
    /// Spacing between agent state reports.
    pub report_interval: Duration,
    /// Handler invocations allowed in flight per worker.
    pub worker_concurrency: usize,
    /// How long a worker waits on its inbound queue before rechecking the
    /// sequencer backlog.
    pub queue_poll_timeout: Duration,
    pub poll_inbox_capacity: usize,
    /// How long a stopping worker waits for in-flight handlers.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lb_policy: LbPolicy::default(),
            poll_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(10),
            worker_concurrency: 64,
            queue_poll_timeout: Duration::from_millis(100),
            poll_inbox_capacity: 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Two workers per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) * 2
}

struct WorkerSlot {
    inbound: mpsc::UnboundedSender<Event>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    wake: Arc<Notify>,
}

/// Handle to the event-dispatch runtime. Cheap to clone; all clones share
/// the same state.
pub struct Controller {
    config: Arc<ControllerConfig>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    agents: Arc<RwLock<Vec<Arc<dyn RpcAgent>>>>,
    sequencer: Arc<EventSequencer>,
    poll: Arc<PollQueueHandler>,
    balancer: Arc<dyn LoadBalancer>,
    workers: Arc<Vec<WorkerSlot>>,
    started: Arc<AtomicBool>,
    shutdown: CancellationToken,
    threads: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            handlers: Arc::clone(&self.handlers),
            agents: Arc::clone(&self.agents),
            sequencer: Arc::clone(&self.sequencer),
            poll: Arc::clone(&self.poll),
            balancer: Arc::clone(&self.balancer),
            workers: Arc::clone(&self.workers),
            started: Arc::clone(&self.started),
            shutdown: self.shutdown.clone(),
            threads: Arc::clone(&self.threads),
        }
    }
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if config.worker_concurrency == 0 {
            return Err(Error::Config("worker concurrency must be at least 1".to_string()));
        }
        if config.poll_interval.is_zero() || config.report_interval.is_zero() {
            return Err(Error::Config("tick intervals must be non-zero".to_string()));
        }

        let workers = (0..config.workers)
            .map(|_| {
                let (inbound, receiver) = mpsc::unbounded_channel();
                WorkerSlot {
                    inbound,
                    receiver: Mutex::new(Some(receiver)),
                    wake: Arc::new(Notify::new()),
                }
            })
            .collect();

        Ok(Self {
            handlers: Arc::new(RwLock::new(HandlerRegistry::empty())),
            agents: Arc::new(RwLock::new(Vec::new())),
            sequencer: Arc::new(EventSequencer::new()),
            poll: Arc::new(PollQueueHandler::new(config.poll_inbox_capacity)),
            balancer: Arc::from(config.lb_policy.build(config.workers)),
            workers: Arc::new(workers),
            started: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            threads: Arc::new(Mutex::new(Vec::new())),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_events(&self, descriptors: Vec<EventDescriptor>) -> Result<()> {
        if self.is_started() {
            return Err(Error::RegistrationClosed);
        }
        let mut registry = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for descriptor in descriptors {
            debug!(event_id = %descriptor.id, "event registered");
            registry.register(descriptor);
        }
        Ok(())
    }

    pub fn register_rpc_agents(&self, agents: Vec<Arc<dyn RpcAgent>>) -> Result<()> {
        if self.is_started() {
            return Err(Error::RegistrationClosed);
        }
        let mut registered = self.agents.write().unwrap_or_else(|e| e.into_inner());
        for agent in agents {
            debug!(agent = agent.name(), "rpc agent registered");
            registered.push(agent);
        }
        Ok(())
    }

    pub fn handler_for(&self, event_id: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_id)
    }

    pub fn periodic_task(&self, event_id: &str) -> Option<PeriodicTask> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .periodic_task(event_id)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Build an event. Nothing is submitted.
    pub fn new_event(&self, id: impl Into<String>) -> Event {
        Event::new(id)
    }

    /// Alias of [`Controller::new_event`].
    pub fn event(&self, id: impl Into<String>) -> Event {
        self.new_event(id)
    }

    /// Route an event to a worker, holding it back if a serialized sibling
    /// is in flight.
    pub fn post_event(&self, mut event: Event) -> Result<()> {
        let worker = self.attach(&mut event)?;

        metrics::events_posted().add(
            1,
            &[
                KeyValue::new("event_id", event.id.clone()),
                KeyValue::new("dispatch", event.dispatch.to_string()),
            ],
        );

        if event.is_sequenced() && self.sequencer.add(&event) {
            metrics::events_sequenced().add(1, &[KeyValue::new("event_id", event.id.clone())]);
            return Ok(());
        }

        debug!(
            event_id = %event.id,
            event_uuid = %event.short_uuid(),
            %worker,
            dispatch = %event.dispatch,
            "event posted"
        );
        self.workers[worker.0]
            .inbound
            .send(event)
            .map_err(|_| Error::WorkerUnavailable(worker))
    }

    /// Release the sequencer group of a finished serialized event so the next
    /// queued sibling can run. No-op for events that were never sequenced.
    pub fn event_done(&self, event: &Event) {
        if !event.is_sequenced() {
            return;
        }
        let Some(worker) = event.worker_attached else {
            return;
        };
        if self.sequencer.release(event) {
            if let Some(slot) = self.workers.get(worker.0) {
                slot.wake.notify_one();
            }
        }
        debug!(event_id = %event.id, event_uuid = %event.short_uuid(), %worker, "event done");
    }

    /// Hand an event to the poll queue. `max_times` of `None` polls until
    /// [`Controller::poll_event_done`].
    pub fn poll_event(&self, mut event: Event, max_times: Option<u32>) -> Result<()> {
        self.attach(&mut event)?;
        event.max_times = max_times;
        event.dispatch = DispatchKind::Ordinary;
        debug!(
            event_id = %event.id,
            group = %event.poll_group(),
            ?max_times,
            "event added to poll queue"
        );
        self.poll.add(PollEntry::Active(event))
    }

    /// Stop polling the event's group. Takes effect on the next tick.
    pub fn poll_event_done(&self, event: &Event) -> Result<()> {
        self.poll.add(PollEntry::Done(event.clone()))
    }

    /// One poll tick.
    pub fn timeout(&self) -> TickReport {
        let registry = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        self.poll
            .run(Utc::now(), &registry, |event| self.post_event(event))
    }

    /// Ask every agent that opted in to report its state.
    pub async fn report_state(&self) {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner()).clone();
        for agent in agents {
            match tokio::time::timeout(self.config.report_interval, agent.report_state(self))
                .await
            {
                Ok(Ok(())) => debug!(agent = agent.name(), "state reported"),
                Ok(Err(e)) if e.is_hook_absent() => {}
                Ok(Err(e)) => warn!(agent = agent.name(), error = %e, "state report failed"),
                Err(_) => warn!(agent = agent.name(), "state report timed out"),
            }
        }
    }

    /// Coarse lock over the sequencer map. Dropping the guard unlocks. The
    /// holding thread may keep posting and releasing events meanwhile.
    pub fn lock(&self) -> SequencerGuard<'_> {
        self.sequencer.lock()
    }

    pub fn sequencer(&self) -> &EventSequencer {
        &self.sequencer
    }

    pub fn poll_queue(&self) -> &PollQueueHandler {
        &self.poll
    }

    /// Next released sibling waiting for a worker.
    pub(crate) fn next_sequenced(&self, worker: WorkerId) -> Option<Event> {
        self.sequencer.next_ready(worker)
    }

    fn attach(&self, event: &mut Event) -> Result<WorkerId> {
        let worker = match event.worker_attached {
            Some(worker) if worker.0 < self.workers.len() => worker,
            Some(worker) => return Err(Error::UnknownWorker(worker)),
            None => self.balancer.get(event.binding_key.as_deref()),
        };
        event.worker_attached = Some(worker);
        Ok(worker)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Run every module's `module_init`, then every module's `init_complete`.
    /// Missing hooks are skipped; any other failure aborts startup.
    pub fn init(&self, modules: &[Box<dyn ServiceModule>]) -> Result<()> {
        for module in modules {
            match module.module_init(self, &self.config) {
                Ok(()) => info!(module = module.name(), "module initialized"),
                Err(e) if e.is_hook_absent() => {
                    warn!(module = module.name(), "module has no module_init, skipping")
                }
                Err(e) => {
                    error!(module = module.name(), error = %e, "module_init failed");
                    return Err(e);
                }
            }
        }
        for module in modules {
            match module.init_complete(self, &self.config) {
                Ok(()) => debug!(module = module.name(), "module init complete"),
                Err(e) if e.is_hook_absent() => {
                    debug!(module = module.name(), "module has no init_complete")
                }
                Err(e) => {
                    error!(module = module.name(), error = %e, "init_complete failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Spawn worker threads, the periodic timers and agent listeners. Must
    /// be called from within a tokio runtime.
    ///
    /// A failure while spawning workers is terminal: the workers already
    /// running are told to stop and the controller cannot be started again.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("start requires a tokio runtime: {e}")))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        if let Err(e) = self.spawn_workers() {
            error!(error = %e, "failed to spawn workers, stopping");
            self.shutdown.cancel();
            return Err(e);
        }

        runtime.spawn(self.clone().run_poll_timer());
        runtime.spawn(self.clone().run_report_timer());

        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner()).clone();
        for agent in agents {
            let controller = self.clone();
            runtime.spawn(async move {
                if let Err(e) = agent.start(&controller).await {
                    error!(agent = agent.name(), error = %e, "rpc agent listener failed");
                }
            });
        }

        info!(
            workers = self.workers.len(),
            policy = %self.config.lb_policy,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "controller started"
        );
        Ok(())
    }

    fn spawn_workers(&self) -> Result<()> {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for (index, slot) in self.workers.iter().enumerate() {
            let worker = WorkerId(index);
            let receiver = slot
                .receiver
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or(Error::AlreadyStarted)?;
            let queue = EventQueueHandler::new(
                worker,
                self.clone(),
                receiver,
                Arc::clone(&slot.wake),
                self.shutdown.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("nfp-{worker}"))
                .spawn(move || run_worker(queue))?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Signal workers and timers to stop, then wait for worker threads.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if threads.is_empty() {
            return;
        }
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    error!("worker thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            error!(error = %e, "failed to join worker threads");
        }
        info!("controller stopped");
    }

    async fn run_poll_timer(self) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("poll timer stopped");
                    return;
                }
                _ = tick.tick() => {
                    let report = self.timeout();
                    if report.dispatched + report.cancelled + report.removed > 0 {
                        debug!(
                            admitted = report.admitted,
                            scanned = report.scanned,
                            dispatched = report.dispatched,
                            cancelled = report.cancelled,
                            removed = report.removed,
                            "poll tick"
                        );
                    }
                }
            }
        }
    }

    async fn run_report_timer(self) {
        let mut tick = tokio::time::interval(self.config.report_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("report timer stopped");
                    return;
                }
                _ = tick.tick() => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = self.report_state() => {}
                    }
                }
            }
        }
    }
}

/// Worker thread body: a single-threaded runtime driving one queue handler.
fn run_worker(queue: EventQueueHandler) {
    let worker = queue.worker();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(%worker, error = %e, "failed to build worker runtime");
            return;
        }
    };
    runtime.block_on(queue.run());
}

//! In-process event loop.
//!
//! Stands in for the durable event log and the isolated execution environment:
//! events are drained from a channel in windows, ordered, and handled with one
//! task per work item. Dispatch effects run agents through the invoker and
//! feed their results back into the same channel. Events that fail with a
//! transient error are held back and queued again.

use crate::config::OrchestratorConfig;
use crate::invoker::AgentInvoker;
use crate::orchestrator::Orchestrator;
use crate::outbound::Outbound;
use crate::registry::AgentRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use wuselig_audit::AuditLog;
use wuselig_core::{Effect, ErrorKind, Event, WorkItemId, WuseligResult};
use wuselig_store::WorkflowStore;

const IDLE_POLL: Duration = Duration::from_millis(25);
const REDELIVER_INTERVAL: Duration = Duration::from_secs(5);

/// Unbounded FIFO of inbound and internal events.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    pub fn push(&self, event: Event) {
        // The queue owns a receiver, so sending cannot fail.
        let _ = self.tx.send(event);
    }

    /// Take everything currently queued without waiting.
    pub async fn drain(&self) -> Vec<Event> {
        let mut rx = self.rx.lock().await;
        let mut window = Vec::new();
        while let Ok(event) = rx.try_recv() {
            window.push(event);
        }
        window
    }

    /// Wait for at least one event, then take everything queued.
    pub async fn next_window(&self) -> Vec<Event> {
        let mut rx = self.rx.lock().await;
        let mut window = Vec::new();
        if let Some(event) = rx.recv().await {
            window.push(event);
        }
        while let Ok(event) = rx.try_recv() {
            window.push(event);
        }
        window
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Order a dispatch window: by arrival time, then labels before comment
/// commands, then by delivery id.
pub fn order_window(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.kind.precedence().cmp(&b.kind.precedence()))
            .then_with(|| a.delivery_id.cmp(&b.delivery_id))
    });
}

/// Routes dispatch effects to local agent executors and everything else to the
/// tracker sink.
pub struct LocalExecution {
    invoker: AgentInvoker,
    tracker: Arc<dyn Outbound>,
    results: mpsc::UnboundedSender<Event>,
    in_flight: Arc<AtomicUsize>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl LocalExecution {
    pub fn new(
        invoker: AgentInvoker,
        tracker: Arc<dyn Outbound>,
        results: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            invoker,
            tracker,
            results,
            in_flight: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Agent invocations started but not yet reported back.
    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    /// Dispatches currently running.
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl Outbound for LocalExecution {
    async fn deliver(&self, effect: &Effect) -> WuseligResult<()> {
        let Effect::Dispatch { task, delay_ms } = effect else {
            return self.tracker.deliver(effect).await;
        };
        let key = effect.idempotency_key();
        if !self.running.lock().insert(key.clone()) {
            debug!(work_item = %task.work_item_id, phase = %task.phase, "dispatch already running");
            return Ok(());
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight {
            count: self.in_flight.clone(),
            running: self.running.clone(),
            key,
        };
        let invoker = self.invoker.clone();
        let results = self.results.clone();
        let task = task.clone();
        let delay = Duration::from_millis(*delay_ms);
        tokio::spawn(async move {
            let _guard = guard;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let event = invoker.invoke(&task).await.into_event(&task);
            let _ = results.send(event);
        });
        Ok(())
    }
}

/// Releases a running dispatch once its result has been queued.
struct InFlight {
    count: Arc<AtomicUsize>,
    running: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.running.lock().remove(&self.key);
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counts from processing one or more windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub handled: usize,
    pub failed: usize,
    /// Failed events held back for redelivery.
    pub deferred: usize,
}

impl RunReport {
    fn add(&mut self, other: RunReport) {
        self.handled += other.handled;
        self.failed += other.failed;
        self.deferred += other.deferred;
    }
}

/// Event loop tying queue, orchestrator and local execution together.
pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    queue: EventQueue,
    in_flight: Arc<AtomicUsize>,
    deferred: Mutex<Vec<Event>>,
}

impl Runtime {
    pub fn new(
        config: &OrchestratorConfig,
        store: Arc<dyn WorkflowStore>,
        tracker: Arc<dyn Outbound>,
        audit: Arc<AuditLog>,
        registry: AgentRegistry,
    ) -> WuseligResult<Self> {
        let queue = EventQueue::new();
        let invoker = AgentInvoker::new(registry, config.invoker.max_duration());
        let execution = LocalExecution::new(invoker, tracker, queue.sender());
        let in_flight = execution.in_flight();
        let orchestrator = Orchestrator::new(config, store, Arc::new(execution), audit)?;
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            queue,
            in_flight,
            deferred: Mutex::new(Vec::new()),
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.queue.sender()
    }

    pub fn submit(&self, event: Event) {
        self.queue.push(event);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Events held back after a transient failure.
    pub fn deferred(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Queue held-back events again. Returns how many were queued.
    pub fn redeliver_deferred(&self) -> usize {
        let events = std::mem::take(&mut *self.deferred.lock());
        let count = events.len();
        for event in events {
            self.queue.push(event);
        }
        if count > 0 {
            debug!(events = count, "redelivering deferred events");
        }
        count
    }

    /// Handle one window: work items in parallel, events of one item in order.
    pub async fn process_window(&self, mut events: Vec<Event>) -> RunReport {
        order_window(&mut events);
        let mut per_item: BTreeMap<WorkItemId, Vec<Event>> = BTreeMap::new();
        for event in events {
            per_item.entry(event.work_item.clone()).or_default().push(event);
        }

        let mut tasks = JoinSet::new();
        for (item, events) in per_item {
            let orchestrator = self.orchestrator.clone();
            tasks.spawn(async move {
                let mut report = RunReport::default();
                let mut retry = Vec::new();
                for event in events {
                    match orchestrator.handle(&event).await {
                        Ok(_) => report.handled += 1,
                        Err(e) => {
                            error!(
                                work_item = %item,
                                delivery_id = %event.delivery_id,
                                error = %e,
                                "failed to handle event"
                            );
                            report.failed += 1;
                            if e.kind() == ErrorKind::Transient {
                                retry.push(event);
                            }
                        }
                    }
                }
                report.deferred = retry.len();
                (report, retry)
            });
        }

        let mut report = RunReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((r, retry)) => {
                    report.add(r);
                    self.deferred.lock().extend(retry);
                }
                Err(e) => error!(error = %e, "work item task aborted"),
            }
        }
        report
    }

    /// Process windows until the queue is empty and no agent is running.
    pub async fn run_until_idle(&self) -> RunReport {
        let mut report = RunReport::default();
        loop {
            let mut window = self.queue.drain().await;
            if window.is_empty() {
                if self.in_flight() == 0 {
                    // A result may have been queued right before the counter dropped.
                    window = self.queue.drain().await;
                    if window.is_empty() {
                        return report;
                    }
                } else {
                    match tokio::time::timeout(IDLE_POLL, self.queue.next_window()).await {
                        Ok(w) => window = w,
                        Err(_) => continue,
                    }
                }
            }
            debug!(events = window.len(), "processing window");
            report.add(self.process_window(window).await);
        }
    }

    /// Process windows until `shutdown` flips to `true`.
    ///
    /// Periodically redelivers deferred events and pending outboxes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunReport {
        info!("runtime started");
        let mut report = RunReport::default();
        let mut redeliver = tokio::time::interval(REDELIVER_INTERVAL);
        redeliver.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                window = self.queue.next_window() => {
                    report.add(self.process_window(window).await);
                }
                _ = redeliver.tick() => {
                    if let Err(e) = self.orchestrator.recover().await {
                        warn!(error = %e, "outbox recovery failed");
                    }
                    self.redeliver_deferred();
                }
            }
        }
        info!(handled = report.handled, failed = report.failed, "runtime stopped");
        report
    }
}

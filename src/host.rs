//! Host base: lifecycle, worker pool and message loop
//!
//! Every concrete host composes this base. Service / Process / Operation are
//! not subclasses; they are [`HostBehaviour`] implementations plugged into a
//! [`Host`], which owns the lifecycle state machine, the bounded queue, the
//! workers and the metrics. The worker loop contract is identical whatever
//! the execution strategy runs it on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Item;
use crate::domain::{
    Direction, HostState, ItemName, ItemType, MessageState, MessagingPattern, QueueKind,
};
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::executor::{self, WorkerHandle};
use crate::queue::MessageQueue;
use crate::registry::Broker;
use crate::trace::Tracer;
use crate::wal::Wal;

/// A copy routed to an explicit target by a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedCopy {
    pub target: ItemName,
    pub envelope: Envelope,
}

/// What `process` produced. Serialisable so it can cross a process-worker
/// boundary unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessOutcome {
    /// Result envelope forwarded to the host's configured targets.
    Forward(Envelope),
    /// Result envelopes routed to explicit targets (rule engine).
    Route(Vec<RoutedCopy>),
    /// Terminal: delivered externally or consumed. The optional envelope is
    /// the response view (an ACK, say) handed back to synchronous callers.
    Done(Option<Envelope>),
    /// The message was deliberately dropped (a `delete` rule).
    Dropped { reason: String },
}

/// Pluggable host behaviour: hooks plus the `process` verb.
///
/// Default hook implementations are identity / log-and-propagate. `process`
/// must not block unboundedly; long work belongs on a `Threaded` or
/// `MultiProcess` execution strategy.
#[async_trait]
pub trait HostBehaviour: Send + Sync {
    /// One-shot initialisation before the first start.
    async fn on_init(&self, _ctx: &HostContext) -> Result<()> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &HostContext) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &HostContext) -> Result<()> {
        Ok(())
    }

    async fn on_teardown(&self, _ctx: &HostContext) -> Result<()> {
        Ok(())
    }

    /// Applies new settings mid-flight (adapters released and reacquired by
    /// the implementation as needed).
    async fn on_reload(&self, _item: &Item) -> Result<()> {
        Ok(())
    }

    async fn on_before_process(&self, envelope: Envelope) -> Result<Envelope> {
        Ok(envelope)
    }

    async fn process(&self, envelope: Envelope) -> Result<ProcessOutcome>;

    async fn on_after_process(
        &self,
        _envelope: &Envelope,
        outcome: ProcessOutcome,
    ) -> Result<ProcessOutcome> {
        Ok(outcome)
    }

    /// Last chance to replace a failure with a result. Returning `None`
    /// propagates the error.
    async fn on_process_error(
        &self,
        envelope: &Envelope,
        err: &EngineError,
    ) -> Option<ProcessOutcome> {
        warn!(message_id = %envelope.message_id, error = %err, "process error");
        None
    }

    /// Long-running adapter task (a TCP listener, say). Inbound hosts
    /// override this; it runs until cancelled.
    async fn run_adapter(&self, _ctx: HostContext) -> Result<()> {
        Ok(())
    }
}

/// Everything a behaviour needs from its surroundings. Cheap to clone.
#[derive(Clone)]
pub struct HostContext {
    pub name: ItemName,
    pub item_type: ItemType,
    pub item: Item,
    pub broker: Broker,
    pub tracer: Tracer,
    pub wal: Arc<Wal>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("name", &self.name)
            .field("item_type", &self.item_type)
            .finish_non_exhaustive()
    }
}

/// Monotonic per-host counters.
#[derive(Debug, Default)]
pub struct HostMetrics {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

/// Point-in-time view of a host for health snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct HostHealth {
    pub name: String,
    pub item_type: ItemType,
    pub state: HostState,
    pub queue_depth: usize,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub avg_latency_ms: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

struct HostRuntime {
    broker: Broker,
    tracer: Tracer,
    wal: Arc<Wal>,
}

/// One runtime actor: queue in, behaviour, messages out.
pub struct Host {
    name: ItemName,
    item_type: ItemType,
    item: RwLock<Item>,
    state: RwLock<HostState>,
    queue: RwLock<Arc<MessageQueue>>,
    behaviour: Arc<dyn HostBehaviour>,
    runtime: OnceLock<HostRuntime>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    run_cancel: Mutex<CancellationToken>,
    paused: watch::Sender<bool>,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
    metrics: HostMetrics,
    restart_count: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("item_type", &self.item_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn build_queue(item: &Item, name: &ItemName) -> Result<Arc<MessageQueue>> {
    let settings = &item.host_settings;
    // Synchronous reliability requires strict ordering.
    let kind = if settings.messaging_pattern == MessagingPattern::SyncReliable
        && settings.queue_type != QueueKind::Fifo
    {
        warn!(item = %name, "sync_reliable forces a FIFO queue");
        QueueKind::Fifo
    } else {
        settings.queue_type
    };
    Ok(Arc::new(MessageQueue::new(
        name.as_str(),
        kind,
        settings.queue_size,
        settings.overflow_strategy,
    )))
}

impl Host {
    pub fn new(item: Item, behaviour: Arc<dyn HostBehaviour>) -> Result<Arc<Self>> {
        let name = item.item_name()?;
        let queue = build_queue(&item, &name)?;
        let (paused, _) = watch::channel(false);
        Ok(Arc::new(Self {
            name,
            item_type: item.item_type,
            item: RwLock::new(item),
            state: RwLock::new(HostState::Initialising),
            queue: RwLock::new(queue),
            behaviour,
            runtime: OnceLock::new(),
            workers: tokio::sync::Mutex::new(Vec::new()),
            run_cancel: Mutex::new(CancellationToken::new()),
            paused,
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            metrics: HostMetrics::default(),
            restart_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }))
    }

    /// Injected once by the engine after the registry is wired. Hosts never
    /// own the broker; they borrow it through this handle.
    pub fn attach(&self, broker: Broker, tracer: Tracer, wal: Arc<Wal>) {
        let _ = self.runtime.set(HostRuntime {
            broker,
            tracer,
            wal,
        });
    }

    #[must_use]
    pub fn name(&self) -> &ItemName {
        &self.name
    }

    #[must_use]
    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// The pluggable behaviour. Used by the admin surface's `test_send`.
    #[must_use]
    pub fn behaviour(&self) -> Arc<dyn HostBehaviour> {
        Arc::clone(&self.behaviour)
    }

    #[must_use]
    pub fn state(&self) -> HostState {
        *self.state.read().expect("state lock")
    }

    #[must_use]
    pub fn item_snapshot(&self) -> Item {
        self.item.read().expect("item lock").clone()
    }

    #[must_use]
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue.read().expect("queue lock"))
    }

    #[must_use]
    pub fn hop_limit(&self) -> u32 {
        self.item
            .read()
            .expect("item lock")
            .host_settings
            .hop_limit
            .as_u32()
    }

    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        self.item
            .read()
            .expect("item lock")
            .host_settings
            .message_timeout_ms
            .as_duration()
    }

    #[must_use]
    pub fn messaging_pattern(&self) -> MessagingPattern {
        self.item
            .read()
            .expect("item lock")
            .host_settings
            .messaging_pattern
    }

    /// Token cancelled when the current run stops. Producers blocked on a
    /// full queue observe it.
    #[must_use]
    pub fn run_token(&self) -> CancellationToken {
        self.run_cancel.lock().expect("cancel lock").clone()
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn note_restart(&self) -> u32 {
        self.restart_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_restart_count(&self) {
        self.restart_count.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn health(&self) -> HostHealth {
        let processed = self.metrics.processed.load(Ordering::Relaxed);
        let total_latency = self.metrics.total_latency_ms.load(Ordering::Relaxed);
        HostHealth {
            name: self.name.as_str().to_string(),
            item_type: self.item_type,
            state: self.state(),
            queue_depth: self.queue().len(),
            received: self.metrics.received.load(Ordering::Relaxed),
            processed,
            failed: self.metrics.failed.load(Ordering::Relaxed),
            avg_latency_ms: if processed == 0 {
                0
            } else {
                total_latency / processed
            },
            restart_count: self.restart_count(),
            last_error: self.last_error.lock().expect("error lock").clone(),
        }
    }

    fn set_state(&self, to: HostState) -> Result<()> {
        let mut state = self.state.write().expect("state lock");
        if !state.can_transition_to(to) {
            return Err(EngineError::StateTransition { from: *state, to });
        }
        debug!(host = %self.name, from = ?*state, to = ?to, "host state transition");
        *state = to;
        Ok(())
    }

    /// Lateral transition into `Error`; the supervisor takes it from there.
    pub fn record_error(&self, detail: impl Into<String>) {
        let detail = detail.into();
        error!(host = %self.name, detail, "host entered error state");
        *self.last_error.lock().expect("error lock") = Some(detail);
        let mut state = self.state.write().expect("state lock");
        if state.can_transition_to(HostState::Error) {
            *state = HostState::Error;
        }
    }

    fn runtime(&self) -> Result<&HostRuntime> {
        self.runtime
            .get()
            .ok_or_else(|| EngineError::internal(format!("host {} not attached", self.name)))
    }

    fn context(&self) -> Result<HostContext> {
        let runtime = self.runtime()?;
        Ok(HostContext {
            name: self.name.clone(),
            item_type: self.item_type,
            item: self.item_snapshot(),
            broker: runtime.broker.clone(),
            tracer: runtime.tracer.clone(),
            wal: Arc::clone(&runtime.wal),
            cancel: self.run_token(),
        })
    }

    /// One-shot initialisation.
    pub async fn init(&self) -> Result<()> {
        let ctx = self.context()?;
        self.behaviour.on_init(&ctx).await
    }

    /// Starts workers and (for services) the adapter. Idempotent while
    /// running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() == HostState::Running {
            return Ok(());
        }
        self.set_state(HostState::Starting)?;

        let cancel = CancellationToken::new();
        *self.run_cancel.lock().expect("cancel lock") = cancel.clone();
        let _ = self.paused.send(false);

        let item = self.item_snapshot();
        let pool_size = item.effective_pool_size();
        let mode = item.host_settings.execution_mode;

        // Per-worker behaviours: process strategies get a child process each,
        // everything else shares the one behaviour instance.
        let behaviours =
            executor::worker_behaviours(mode, pool_size, &item, Arc::clone(&self.behaviour))
                .await?;

        let mut handles = Vec::with_capacity(behaviours.len());
        let worker_handles = executor::start_workers(mode, behaviours.len(), |worker_id| {
            let host = Arc::clone(self);
            let behaviour = Arc::clone(&behaviours[worker_id]);
            let cancel = cancel.clone();
            Box::pin(async move {
                worker_loop(host, behaviour, cancel, worker_id).await;
            })
        })?;
        handles.extend(worker_handles);

        // Inbound adapters run beside the workers.
        if self.item_type == ItemType::Service {
            let ctx = self.context()?;
            let host = Arc::clone(self);
            let behaviour = Arc::clone(&self.behaviour);
            handles.push(WorkerHandle::task(tokio::spawn(async move {
                if let Err(e) = behaviour.run_adapter(ctx).await {
                    host.record_error(format!("adapter failed: {e}"));
                }
            })));
        }

        *self.workers.lock().await = handles;

        let ctx = self.context()?;
        self.behaviour.on_start(&ctx).await?;
        self.set_state(HostState::Running)?;
        info!(host = %self.name, workers = pool_size, "host running");
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.set_state(HostState::Paused)?;
        let _ = self.paused.send(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.set_state(HostState::Running)?;
        let _ = self.paused.send(false);
        Ok(())
    }

    #[must_use]
    pub fn pause_watch(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Stops workers, waiting up to `timeout` for in-flight work. Queue
    /// contents stay in the WAL and replay on the next start.
    pub async fn stop(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        match self.state() {
            HostState::Stopped => return Ok(()),
            // Never started: nothing to wind down.
            HostState::Initialising => {
                *self.state.write().expect("state lock") = HostState::Stopped;
                return Ok(());
            }
            _ => {}
        }
        self.set_state(HostState::Stopping)?;

        let ctx = self.context()?;
        if let Err(e) = self.behaviour.on_stop(&ctx).await {
            warn!(host = %self.name, error = %e, "on_stop hook failed");
        }

        self.run_token().cancel();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        executor::stop_workers(handles, timeout).await;

        if let Err(e) = self.behaviour.on_teardown(&ctx).await {
            warn!(host = %self.name, error = %e, "on_teardown hook failed");
        }

        self.set_state(HostState::Stopped)?;
        info!(host = %self.name, "host stopped");
        Ok(())
    }

    /// Hot reload: pause, drain in-flight, apply new settings, restart
    /// workers. The queue (and any pending requests against this host) are
    /// preserved.
    pub async fn reload(self: &Arc<Self>, new_item: Item) -> Result<()> {
        let new_name = new_item.item_name()?;
        if new_name != self.name {
            return Err(EngineError::validation(format!(
                "reload cannot rename host {} to {new_name}",
                self.name
            )));
        }

        let previous_state = self.state();
        let was_active = matches!(
            previous_state,
            HostState::Running | HostState::Paused | HostState::Error
        );
        let drain_timeout = new_item.host_settings.drain_timeout_ms.as_duration();

        if previous_state == HostState::Running {
            self.pause()?;
        }

        // Drain: let whatever is mid-process finish.
        let drained = tokio::time::timeout(drain_timeout, async {
            while self.in_flight.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(host = %self.name, "drain timeout during reload; in-flight work remains in WAL");
        }

        // Retire the old workers.
        self.run_token().cancel();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        executor::stop_workers(handles, drain_timeout).await;

        self.behaviour.on_reload(&new_item).await?;

        // Swap settings; migrate the queue only when its shape changed.
        {
            let old_item = self.item_snapshot();
            let old = &old_item.host_settings;
            let new = &new_item.host_settings;
            if old.queue_type != new.queue_type
                || old.queue_size != new.queue_size
                || old.overflow_strategy != new.overflow_strategy
            {
                let fresh = build_queue(&new_item, &self.name)?;
                let previous = self.queue();
                for envelope in previous.drain() {
                    if let Err(back) = fresh.try_enqueue(envelope) {
                        warn!(
                            host = %self.name,
                            message_id = %back.message_id,
                            "queue shrank on reload; message stays in WAL for replay"
                        );
                    }
                }
                *self.queue.write().expect("queue lock") = fresh;
            }
            *self.item.write().expect("item lock") = new_item;
        }

        if was_active {
            // Re-enter through the start path, then restore the previous
            // pause state.
            {
                let mut state = self.state.write().expect("state lock");
                *state = HostState::Stopped;
            }
            self.start().await?;
            if previous_state == HostState::Paused {
                self.pause()?;
            }
        }
        info!(host = %self.name, "host reloaded");
        Ok(())
    }
}

/// Snapshot of the settings a worker needs per message.
struct LoopSettings {
    targets: Vec<ItemName>,
    message_timeout: Duration,
}

fn loop_settings(host: &Host) -> LoopSettings {
    let item = host.item_snapshot();
    let targets = item
        .host_settings
        .target_config_names
        .iter()
        .filter_map(|t| ItemName::try_new(t.clone()).ok())
        .collect();
    LoopSettings {
        targets,
        message_timeout: item.host_settings.message_timeout_ms.as_duration(),
    }
}

/// The worker loop: identical on a task, a thread or a process pump.
pub(crate) async fn worker_loop(
    host: Arc<Host>,
    behaviour: Arc<dyn HostBehaviour>,
    cancel: CancellationToken,
    worker_id: usize,
) {
    debug!(host = %host.name(), worker_id, "worker started");
    let mut paused = host.pause_watch();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Paused hosts keep their queue; workers idle.
        if *paused.borrow() {
            tokio::select! {
                _ = paused.changed() => continue,
                () = cancel.cancelled() => break,
            }
        }

        let queue = host.queue();
        let envelope = tokio::select! {
            env = queue.dequeue(&cancel) => match env {
                Some(env) => env,
                None => break,
            },
            _ = paused.changed() => continue,
        };

        host.in_flight.fetch_add(1, Ordering::AcqRel);
        process_one(&host, behaviour.as_ref(), envelope).await;
        host.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(host = %host.name(), worker_id, "worker terminated");
}

async fn process_one(host: &Arc<Host>, behaviour: &dyn HostBehaviour, envelope: Envelope) {
    let Ok(runtime) = host.runtime() else {
        error!(host = %host.name(), "worker without runtime; dropping message");
        return;
    };
    let broker = runtime.broker.clone();
    let tracer = runtime.tracer.clone();
    let wal = Arc::clone(&runtime.wal);
    let settings = loop_settings(host);

    host.metrics.received.fetch_add(1, Ordering::Relaxed);

    let direction = match host.item_type() {
        ItemType::Operation => Direction::Outbound,
        ItemType::Process | ItemType::Service => Direction::Internal,
    };
    let sync_caller = envelope
        .correlation_id
        .filter(|corr| broker.has_pending(*corr));

    // Expiry check before any work.
    if envelope.is_expired(chrono::Utc::now()) {
        let expired = envelope.clone().with_state(MessageState::Expired);
        if let Err(e) = wal.append(expired).await {
            error!(host = %host.name(), error = %e, "wal append failed for expired message");
        }
        tracer
            .start_visit(&envelope, host.name(), host.item_type(), direction)
            .expired();
        if let Some(corr) = sync_caller {
            broker.send_response(
                corr,
                Err(EngineError::Expired {
                    message_id: envelope.message_id,
                }),
            );
        }
        return;
    }

    let started = std::time::Instant::now();
    let mut visit = tracer.start_visit(&envelope, host.name(), host.item_type(), direction);

    if let Err(e) = wal
        .append(envelope.clone().with_state(MessageState::Processing))
        .await
    {
        error!(host = %host.name(), error = %e, "wal append failed; failing message");
        visit.fail(&e);
        if let Some(corr) = sync_caller {
            broker.send_response(corr, Err(e));
        }
        return;
    }

    // Hook chain with the error hook as last resort.
    let result = async {
        let before = behaviour.on_before_process(envelope.clone()).await?;
        let outcome = behaviour.process(before).await?;
        behaviour.on_after_process(&envelope, outcome).await
    }
    .await;

    let result = match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => match behaviour.on_process_error(&envelope, &err).await {
            Some(replacement) => Ok(replacement),
            None => Err(err),
        },
    };

    match result {
        // A delete rule consumes the message: delivered, tagged, traced as
        // dropped.
        Ok(ProcessOutcome::Dropped { reason }) => {
            if let Err(e) = wal
                .append(
                    envelope
                        .clone()
                        .with_state(MessageState::Delivered)
                        .with_tag("dropped_by_rule"),
                )
                .await
            {
                error!(host = %host.name(), error = %e, "wal append failed for dropped message");
            }
            host.metrics.processed.fetch_add(1, Ordering::Relaxed);
            visit.dropped(reason);
            if let Some(corr) = sync_caller {
                broker.send_response(corr, Ok(None));
            }
        }
        Ok(outcome) => {
            let response = dispatch_outcome(
                host, &broker, &wal, &envelope, outcome, &settings, &mut visit,
                sync_caller.is_some(),
            )
            .await;

            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match response {
                Ok(reply) => {
                    host.metrics.processed.fetch_add(1, Ordering::Relaxed);
                    host.metrics
                        .total_latency_ms
                        .fetch_add(elapsed, Ordering::Relaxed);
                    let warned = reply
                        .as_ref()
                        .is_some_and(|r| r.tags.iter().any(|t| t == "warned"));
                    if warned {
                        visit.complete_with_warning("remote warned; committed");
                    } else {
                        visit.complete();
                    }
                    if let Some(corr) = sync_caller {
                        broker.send_response(corr, Ok(reply));
                    }
                }
                Err(err) => {
                    fail_message(host, &wal, &tracer, &envelope, visit, &err).await;
                    if let Some(corr) = sync_caller {
                        broker.send_response(corr, Err(err));
                    }
                }
            }
        }
        Err(err) => {
            fail_message(host, &wal, &tracer, &envelope, visit, &err).await;
            if let Some(corr) = sync_caller {
                broker.send_response(corr, Err(err));
            }
        }
    }
}

/// Routes the outcome downstream and records the terminal state of the
/// incoming message. Returns the response envelope for synchronous callers.
#[allow(clippy::too_many_arguments)]
async fn dispatch_outcome(
    host: &Arc<Host>,
    broker: &Broker,
    wal: &Arc<Wal>,
    envelope: &Envelope,
    outcome: ProcessOutcome,
    settings: &LoopSettings,
    visit: &mut crate::trace::Visit,
    sync: bool,
) -> Result<Option<Envelope>> {
    let copies: Vec<RoutedCopy> = match outcome {
        ProcessOutcome::Done(response) => {
            wal.append(envelope.clone().with_state(MessageState::Delivered))
                .await?;
            if let Some(resp) = &response {
                if host.item_type() == ItemType::Operation {
                    let ack_type = resp
                        .message_type
                        .clone()
                        .unwrap_or_else(|| "ACK".to_string());
                    let archive_io = host
                        .item_snapshot()
                        .adapter_settings
                        .get("archive_io")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false);
                    if archive_io {
                        visit.set_ack(resp.payload.raw.clone(), ack_type);
                    } else {
                        visit.set_ack_type(ack_type);
                    }
                }
            }
            return Ok(response);
        }
        // Handled by the caller before dispatch.
        ProcessOutcome::Dropped { .. } => return Ok(None),
        ProcessOutcome::Forward(result) => settings
            .targets
            .iter()
            .map(|target| RoutedCopy {
                target: target.clone(),
                envelope: result.fork(),
            })
            .collect(),
        ProcessOutcome::Route(copies) => copies,
    };

    if copies.is_empty() {
        wal.append(envelope.clone().with_state(MessageState::Delivered))
            .await?;
        return Ok(None);
    }

    if sync {
        // The producer is blocked on us: propagate synchronously so its
        // acknowledgement reflects the whole chain.
        wal.append(envelope.clone().with_state(MessageState::AwaitingReply))
            .await?;
        let mut last_response = None;
        for copy in copies {
            let response = broker
                .send_request_sync(
                    host.name(),
                    &copy.target,
                    copy.envelope,
                    settings.message_timeout,
                )
                .await?;
            last_response = response;
        }
        wal.append(envelope.clone().with_state(MessageState::Delivered))
            .await?;
        Ok(last_response)
    } else {
        for copy in copies {
            // Downstream enqueue failures fail this message too; the
            // failure path dead-letters it.
            broker
                .send_request_async(host.name(), &copy.target, copy.envelope)
                .await?;
        }
        wal.append(envelope.clone().with_state(MessageState::Delivered))
            .await?;
        Ok(None)
    }
}

async fn fail_message(
    host: &Arc<Host>,
    wal: &Arc<Wal>,
    tracer: &Tracer,
    envelope: &Envelope,
    visit: crate::trace::Visit,
    err: &EngineError,
) {
    host.metrics.failed.fetch_add(1, Ordering::Relaxed);
    if let Err(wal_err) = wal
        .append(envelope.clone().with_state(MessageState::Failed))
        .await
    {
        error!(host = %host.name(), error = %wal_err, "wal append failed while failing message");
    }
    visit.fail(err);
    tracer.dead_letter(envelope, host.item_type(), &err.to_string());
}

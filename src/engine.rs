//! Production engine
//!
//! Owns everything process-wide: the WAL, the message store projection, and
//! one deployed generation per production. Deploys build a complete new set
//! of hosts, start them downstream-first, swap the registry, and only then
//! stop the displaced generation — a failed deploy leaves the old one
//! active. A supervisor loop applies restart policies and feeds health
//! snapshots; a housekeeping loop ages out old trace rows.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{Item, ProductionDocument};
use crate::domain::{
    Direction, ItemName, ItemType, MessageId, MessageState, ProjectId, RestartPolicy, SessionId,
};
use crate::envelope::{Envelope, Payload};
use crate::error::{EngineError, Result};
use crate::host::{Host, HostHealth, ProcessOutcome};
use crate::registry::{Broker, ServiceRegistry};
use crate::store::{MessageStore, SessionFilter, SessionSummary, StoreWriter, TraceRecord, status};
use crate::trace::Tracer;
use crate::wal::Wal;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Trace rows older than this are purged.
    pub retention_days: u32,
    pub housekeeping_interval: Duration,
    pub supervisor_interval: Duration,
    /// Queue drain allowance during production stop.
    pub drain_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            housekeeping_interval: Duration::from_secs(3600),
            supervisor_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a successful deploy.
#[derive(Debug, Clone, Serialize)]
pub struct DeploySummary {
    pub project: String,
    pub generation: u64,
    pub items: Vec<String>,
}

/// Result of a `test_send`.
#[derive(Debug, Clone, Serialize)]
pub struct TestSendReport {
    pub session_id: String,
    pub ack_type: Option<String>,
    pub ack: Option<String>,
}

/// Session trace plus the distinct items visited, in visit order.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTraceView {
    pub session_id: String,
    pub items: Vec<String>,
    pub rows: Vec<TraceRow>,
}

/// Trace row shaped for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRow {
    pub item_name: String,
    pub item_type: ItemType,
    pub direction: Direction,
    pub message_id: String,
    pub message_type: Option<String>,
    pub status: String,
    pub source_item: Option<String>,
    pub destination_item: Option<String>,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub raw_content: Option<String>,
    pub ack_type: Option<String>,
}

impl From<TraceRecord> for TraceRow {
    fn from(record: TraceRecord) -> Self {
        Self {
            item_name: record.item_name,
            item_type: record.item_type,
            direction: record.direction,
            message_id: record.message_id.to_string(),
            message_type: record.message_type,
            status: record.status,
            source_item: record.source_item,
            destination_item: record.destination_item,
            latency_ms: record.latency_ms,
            error_message: record.error_message,
            received_at: record.received_at,
            completed_at: record.completed_at,
            raw_content: record
                .raw_content
                .map(|raw| String::from_utf8_lossy(&raw).into_owned()),
            ack_type: record.ack_type,
        }
    }
}

/// Health snapshot across productions.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub productions: Vec<ProductionHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductionHealth {
    pub project: String,
    pub generation: u64,
    pub running: bool,
    pub hosts: Vec<HostHealth>,
}

struct DeployedProduction {
    project: ProjectId,
    document: std::sync::RwLock<ProductionDocument>,
    generation: AtomicU64,
    registry: Arc<ServiceRegistry>,
    broker: Broker,
    tracer: Tracer,
    running: AtomicBool,
}

impl DeployedProduction {
    fn hosts_in_start_order(&self) -> Vec<Arc<Host>> {
        let rank = |t: ItemType| match t {
            ItemType::Operation => 0,
            ItemType::Process => 1,
            ItemType::Service => 2,
        };
        let mut hosts = self.registry.hosts();
        hosts.sort_by_key(|h| rank(h.item_type()));
        hosts
    }

    fn hosts_in_stop_order(&self) -> Vec<Arc<Host>> {
        let mut hosts = self.hosts_in_start_order();
        hosts.reverse();
        hosts
    }
}

/// The in-process orchestrator.
pub struct ProductionEngine {
    wal: Arc<Wal>,
    store: Arc<dyn MessageStore>,
    writer: StoreWriter,
    settings: EngineSettings,
    productions: DashMap<ProjectId, Arc<DeployedProduction>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ProductionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionEngine")
            .field("productions", &self.productions.len())
            .finish_non_exhaustive()
    }
}

impl ProductionEngine {
    /// Must be called from within a Tokio runtime: the store writer,
    /// supervisor and housekeeping tasks start immediately.
    #[must_use]
    pub fn new(wal: Arc<Wal>, store: Arc<dyn MessageStore>, settings: EngineSettings) -> Arc<Self> {
        let (writer, _writer_task) = StoreWriter::spawn(Arc::clone(&store));
        let engine = Arc::new(Self {
            wal,
            store,
            writer,
            settings,
            productions: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        let supervisor = Arc::clone(&engine);
        tokio::spawn(async move { supervisor.supervise().await });
        let housekeeper = Arc::clone(&engine);
        tokio::spawn(async move { housekeeper.housekeeping().await });

        engine
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    fn production(&self, project: &ProjectId) -> Result<Arc<DeployedProduction>> {
        self.productions
            .get(project)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::unknown_target(format!("production {project}")))
    }

    /// Loads and validates a configuration, constructs a new generation of
    /// hosts, and swaps it in. On failure the previous generation stays
    /// active.
    #[instrument(skip(self, document), fields(project = %project))]
    pub async fn deploy(
        &self,
        project: ProjectId,
        document: ProductionDocument,
    ) -> Result<DeploySummary> {
        document.validate()?;

        let production = self
            .productions
            .entry(project.clone())
            .or_insert_with(|| {
                let registry = Arc::new(ServiceRegistry::new());
                let tracer = Tracer::new(project.as_str(), self.writer.clone());
                let broker = Broker::new(Arc::clone(&registry), Arc::clone(&self.wal), tracer.clone());
                Arc::new(DeployedProduction {
                    project: project.clone(),
                    document: std::sync::RwLock::new(document.clone()),
                    generation: AtomicU64::new(0),
                    registry,
                    broker,
                    tracer,
                    running: AtomicBool::new(false),
                })
            })
            .clone();

        // Quiesce old ingress before the new generation binds its listeners.
        let previous_generation = production.registry.hosts();
        let was_running = production.running.load(Ordering::SeqCst);
        let old_services: Vec<Arc<Host>> = previous_generation
            .iter()
            .filter(|h| h.item_type() == ItemType::Service)
            .map(Arc::clone)
            .collect();
        if was_running {
            for service in &old_services {
                if let Err(e) = service.stop(self.settings.drain_timeout).await {
                    warn!(host = %service.name(), error = %e, "old service refused to stop");
                }
            }
        }

        // Build and start the new generation, downstream first.
        let build = async {
            let mut new_hosts = Vec::new();
            for item in document.ordered_for_start() {
                let behaviour = crate::hosts::build_behaviour(item)?;
                let host = Host::new(item.clone(), behaviour)?;
                host.attach(
                    production.broker.clone(),
                    production.tracer.clone(),
                    Arc::clone(&self.wal),
                );
                host.init().await?;
                new_hosts.push(host);
            }
            if was_running {
                for host in &new_hosts {
                    host.start().await?;
                }
            }
            Ok::<Vec<Arc<Host>>, EngineError>(new_hosts)
        }
        .await;

        let new_hosts = match build {
            Ok(hosts) => hosts,
            Err(e) => {
                // Roll back: the old generation remains active.
                error!(project = %project, error = %e, "deploy failed; keeping previous generation");
                if was_running {
                    for service in &old_services {
                        if let Err(restart_err) = service.start().await {
                            error!(host = %service.name(), error = %restart_err, "failed to restore old service");
                        }
                    }
                }
                return Err(e);
            }
        };

        // Swap: after this instant no lookup resolves to an old host.
        let displaced = production.registry.swap_generation(new_hosts.clone());
        for host in displaced {
            if matches!(
                host.state(),
                crate::domain::HostState::Running | crate::domain::HostState::Paused
            ) {
                if let Err(e) = host.stop(self.settings.drain_timeout).await {
                    warn!(host = %host.name(), error = %e, "displaced host refused to stop");
                }
            }
        }

        let generation = production.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *production.document.write().expect("document lock") = document.clone();

        info!(project = %project, generation, "production deployed");
        Ok(DeploySummary {
            project: project.as_str().to_string(),
            generation,
            items: document.items.iter().map(|i| i.name.clone()).collect(),
        })
    }

    /// Starts a deployed production: Operations, then Processes, then
    /// Services.
    #[instrument(skip(self), fields(project = %project))]
    pub async fn start(&self, project: &ProjectId) -> Result<()> {
        let production = self.production(project)?;
        for host in production.hosts_in_start_order() {
            host.start().await?;
        }
        production.running.store(true, Ordering::SeqCst);
        info!(project = %project, "production started");
        Ok(())
    }

    /// Stops a production: Services first (quiesce ingress), a queue drain
    /// window, then Processes and Operations. Whatever does not drain stays
    /// in the WAL and replays on the next start.
    #[instrument(skip(self), fields(project = %project))]
    pub async fn stop(&self, project: &ProjectId, timeout: Duration) -> Result<()> {
        let production = self.production(project)?;

        let hosts = production.hosts_in_stop_order();
        for host in hosts
            .iter()
            .filter(|h| h.item_type() == ItemType::Service)
        {
            host.stop(timeout).await?;
        }

        // Drain window for the remaining queues.
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            loop {
                let depth: usize = hosts.iter().map(|h| h.queue().len()).sum();
                if depth == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(project = %project, "drain timeout on stop; queued messages replay from WAL");
        }

        for host in hosts
            .iter()
            .filter(|h| h.item_type() != ItemType::Service)
        {
            host.stop(timeout).await?;
        }

        production.broker.cancel_all_pending();
        production.running.store(false, Ordering::SeqCst);
        info!(project = %project, "production stopped");
        Ok(())
    }

    /// Hot reload of one host. The registry entry is untouched — same host
    /// instance, new settings.
    #[instrument(skip(self, new_settings), fields(project = %project, item = %item_name))]
    pub async fn reload_host(
        &self,
        project: &ProjectId,
        item_name: &ItemName,
        new_settings: serde_json::Value,
    ) -> Result<()> {
        let production = self.production(project)?;
        let host = production
            .registry
            .get(item_name)
            .ok_or_else(|| EngineError::unknown_target(item_name.as_str()))?;

        let merged = merge_item(&host.item_snapshot(), &new_settings)?;
        host.reload(merged.clone()).await?;

        let mut document = production.document.write().expect("document lock");
        if let Some(slot) = document
            .items
            .iter_mut()
            .find(|i| i.name == item_name.as_str())
        {
            *slot = merged;
        }
        Ok(())
    }

    /// Frames and sends one message through an outbound item, bypassing its
    /// queue. Returns the acknowledgement.
    #[instrument(skip(self, message_bytes), fields(project = %project, item = %item_name))]
    pub async fn test_send(
        &self,
        project: &ProjectId,
        item_name: &ItemName,
        message_bytes: Vec<u8>,
    ) -> Result<TestSendReport> {
        let production = self.production(project)?;
        let host = production
            .registry
            .get(item_name)
            .ok_or_else(|| EngineError::unknown_target(item_name.as_str()))?;
        if host.item_type() != ItemType::Operation {
            return Err(EngineError::validation(format!(
                "test_send targets outbound items; '{item_name}' is a {}",
                host.item_type().as_str()
            )));
        }

        let session = SessionId::test_send();
        let mut envelope = Envelope::new(
            crate::hosts::HL7_BODY_CLASS,
            Payload::hl7(message_bytes),
        )
        .with_session(session.clone());
        if let Ok(parsed) = crate::hl7::Hl7Message::parse(&envelope.payload.raw) {
            if let Some(message_type) = parsed.message_type() {
                envelope = envelope.with_message_type(message_type);
            }
        }

        let visit = production.tracer.start_visit(
            &envelope,
            item_name,
            ItemType::Operation,
            Direction::Outbound,
        );

        self.wal.append(envelope.clone()).await?;
        match host.behaviour().process(envelope.clone()).await {
            Ok(ProcessOutcome::Done(response)) => {
                self.wal
                    .append(envelope.with_state(MessageState::Delivered))
                    .await?;
                let ack_type = response
                    .as_ref()
                    .and_then(|r| r.message_type.clone());
                let ack = response
                    .as_ref()
                    .map(|r| String::from_utf8_lossy(&r.payload.raw).into_owned());
                visit.complete();
                Ok(TestSendReport {
                    session_id: session.as_str().to_string(),
                    ack_type,
                    ack,
                })
            }
            Ok(_other) => {
                visit.complete();
                Ok(TestSendReport {
                    session_id: session.as_str().to_string(),
                    ack_type: None,
                    ack: None,
                })
            }
            Err(e) => {
                self.wal
                    .append(envelope.with_state(MessageState::Failed))
                    .await?;
                visit.fail(&e);
                Err(e)
            }
        }
    }

    /// Re-enqueues a stored message to the item that last handled it.
    /// At-least-once: the resend is a fresh message caused by the original.
    #[instrument(skip(self))]
    pub async fn resend(&self, message_id: MessageId) -> Result<MessageId> {
        let record = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| EngineError::unknown_target(format!("message {message_id}")))?;

        let project = ProjectId::try_new(record.project_id.clone())
            .map_err(|e| EngineError::internal(format!("stored project id: {e}")))?;
        let production = self.production(&project)?;
        let target = ItemName::try_new(record.item_name.clone())
            .map_err(|e| EngineError::internal(format!("stored item name: {e}")))?;

        let raw = record
            .raw_content
            .ok_or_else(|| EngineError::validation("stored message has no raw content"))?;

        let mut envelope = Envelope::new(crate::hosts::HL7_BODY_CLASS, Payload::hl7(raw));
        envelope.causation_id = Some(record.message_id);
        envelope.session_id = record.session_id.clone();
        envelope.message_type = record.message_type.clone();

        let source = ItemName::try_new("__resend__".to_string())
            .expect("static name is valid");
        production
            .broker
            .send_request_async(&source, &target, envelope)
            .await
    }

    pub async fn list_sessions(
        &self,
        project: &ProjectId,
        filter: SessionFilter,
    ) -> Result<Vec<SessionSummary>> {
        let filter = SessionFilter {
            project_id: Some(project.as_str().to_string()),
            ..filter
        };
        self.store.list_sessions(&filter).await
    }

    pub async fn get_session_trace(&self, session_id: &str) -> Result<SessionTraceView> {
        let records = self.store.session_trace(session_id).await?;
        let mut items = Vec::new();
        for record in &records {
            if !items.contains(&record.item_name) {
                items.push(record.item_name.clone());
            }
        }
        Ok(SessionTraceView {
            session_id: session_id.to_string(),
            items,
            rows: records.into_iter().map(TraceRow::from).collect(),
        })
    }

    /// Republishes non-terminal WAL records to their owning hosts' queues.
    /// Replay is idempotent: terminal records are no-ops and duplicates
    /// resolve by latest state.
    pub async fn recover(&self) -> Result<usize> {
        let envelopes = self.wal.replay()?;
        let mut republished = 0usize;
        for envelope in envelopes {
            let Some(destination) = envelope.routing.destination.clone() else {
                continue;
            };
            let Some(host) = self
                .productions
                .iter()
                .find_map(|entry| entry.value().registry.get(&destination))
            else {
                warn!(message_id = %envelope.message_id, target = %destination, "replay target missing");
                continue;
            };
            match host.queue().try_enqueue(envelope) {
                Ok(()) => republished += 1,
                Err(back) => {
                    warn!(message_id = %back.message_id, "replay queue full; record stays in WAL");
                }
            }
        }
        if republished > 0 {
            info!(republished, "wal replay complete");
        }
        Ok(republished)
    }

    #[must_use]
    pub fn health(&self) -> EngineHealth {
        let productions = self
            .productions
            .iter()
            .map(|entry| {
                let production = entry.value();
                ProductionHealth {
                    project: production.project.as_str().to_string(),
                    generation: production.generation.load(Ordering::SeqCst),
                    running: production.running.load(Ordering::SeqCst),
                    hosts: production
                        .hosts_in_start_order()
                        .iter()
                        .map(|h| h.health())
                        .collect(),
                }
            })
            .collect();
        EngineHealth { productions }
    }

    /// Supervisor: polls host states, applies restart policies, decays
    /// restart counts after sustained running.
    async fn supervise(self: Arc<Self>) {
        let mut restarting: HashMap<(String, String), Arc<AtomicBool>> = HashMap::new();
        let mut running_since: HashMap<(String, String), Instant> = HashMap::new();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.supervisor_interval) => {}
            }

            for entry in &self.productions {
                let production = entry.value();
                for host in production.registry.hosts() {
                    let key = (
                        production.project.as_str().to_string(),
                        host.name().as_str().to_string(),
                    );
                    let item = host.item_snapshot();
                    let policy = item.host_settings.restart_policy;
                    let restart_delay = item.host_settings.restart_delay_ms.as_duration();

                    match host.state() {
                        crate::domain::HostState::Running => {
                            let since = running_since.entry(key.clone()).or_insert_with(Instant::now);
                            // Sustained running decays the restart budget.
                            if host.restart_count() > 0 && since.elapsed() > restart_delay * 10 {
                                host.reset_restart_count();
                            }
                        }
                        crate::domain::HostState::Error => {
                            running_since.remove(&key);
                            if policy == RestartPolicy::Never {
                                continue;
                            }
                            if host.restart_count() >= item.host_settings.max_restarts.as_u32() {
                                continue;
                            }
                            let guard = restarting
                                .entry(key.clone())
                                .or_insert_with(|| Arc::new(AtomicBool::new(false)));
                            if guard.swap(true, Ordering::SeqCst) {
                                continue;
                            }

                            let guard = Arc::clone(guard);
                            let host = Arc::clone(&host);
                            tokio::spawn(async move {
                                let attempt = host.note_restart();
                                warn!(host = %host.name(), attempt, "supervisor restarting host");
                                tokio::time::sleep(restart_delay).await;
                                let item = host.item_snapshot();
                                if let Err(e) = host.reload(item).await {
                                    error!(host = %host.name(), error = %e, "supervised restart failed");
                                    host.record_error(format!("restart failed: {e}"));
                                }
                                guard.store(false, Ordering::SeqCst);
                            });
                        }
                        _ => {
                            running_since.remove(&key);
                        }
                    }
                }
            }
        }
    }

    async fn housekeeping(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.housekeeping_interval) => {}
            }
            match self.store.delete_older_than(self.settings.retention_days).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "housekeeping purged old trace rows"),
                Err(e) => warn!(error = %e, "housekeeping failed"),
            }
        }
    }

    /// Stops every production and the background loops.
    pub async fn shutdown(&self, timeout: Duration) {
        let projects: Vec<ProjectId> = self
            .productions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for project in projects {
            if let Err(e) = self.stop(&project, timeout).await {
                warn!(project = %project, error = %e, "stop during shutdown failed");
            }
        }
        self.shutdown.cancel();
    }

    /// Dead-letter listing: trace rows whose destination is the logical
    /// dead-letter sink.
    pub async fn dead_letters(&self, project: &ProjectId) -> Result<Vec<TraceRow>> {
        let filter = crate::store::MessageFilter {
            status: Some(status::DEAD_LETTERED.to_string()),
            ..crate::store::MessageFilter::for_project(project.as_str())
        };
        Ok(self
            .store
            .list_messages(&filter)
            .await?
            .into_iter()
            .map(TraceRow::from)
            .collect())
    }
}

/// Merges a partial settings document into an item: `pool_size` and
/// `enabled` replace, `adapter_settings` and `host_settings` merge by key.
fn merge_item(current: &Item, new_settings: &serde_json::Value) -> Result<Item> {
    let Some(patch) = new_settings.as_object() else {
        return Err(EngineError::validation(
            "reload settings must be a JSON object",
        ));
    };

    let mut merged = current.clone();
    if let Some(pool_size) = patch.get("pool_size") {
        merged.pool_size = serde_json::from_value(pool_size.clone())?;
    }
    if let Some(enabled) = patch.get("enabled").and_then(serde_json::Value::as_bool) {
        merged.enabled = enabled;
    }
    if let Some(adapter) = patch.get("adapter_settings").and_then(|v| v.as_object()) {
        for (key, value) in adapter {
            merged.adapter_settings.insert(key.clone(), value.clone());
        }
    }
    if let Some(host_patch) = patch.get("host_settings").and_then(|v| v.as_object()) {
        let mut host_value = serde_json::to_value(&merged.host_settings)?;
        if let Some(map) = host_value.as_object_mut() {
            for (key, value) in host_patch {
                map.insert(key.clone(), value.clone());
            }
        }
        merged.host_settings = serde_json::from_value(host_value)?;
    }
    Ok(merged)
}

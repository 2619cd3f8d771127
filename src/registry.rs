//! Service registry and broker
//!
//! The registry maps item names to host handles; readers never block, and
//! deploys swap entries atomically per name. The broker is the only way
//! messages move between hosts: it stamps routing metadata, enforces the hop
//! limit, appends to the WAL before any enqueue, and tracks the response
//! slots behind synchronous requests.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::domain::{CorrelationId, ItemName, MessageId, MessageState};
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::host::Host;
use crate::queue::EnqueueOutcome;
use crate::trace::Tracer;
use crate::wal::Wal;

/// Name → host lookup for one deployed production generation.
#[derive(Default)]
pub struct ServiceRegistry {
    hosts: DashMap<ItemName, Arc<Host>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("hosts", &self.hosts.len())
            .finish()
    }
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: Arc<Host>) {
        self.hosts.insert(host.name().clone(), host);
    }

    #[must_use]
    pub fn get(&self, name: &ItemName) -> Option<Arc<Host>> {
        self.hosts.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<ItemName> {
        self.hosts.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Replaces the whole generation. Each name swaps atomically; after this
    /// returns, no lookup resolves to a previous-generation host. The
    /// displaced hosts are returned for orderly stopping.
    pub fn swap_generation(&self, new_hosts: Vec<Arc<Host>>) -> Vec<Arc<Host>> {
        let mut displaced = Vec::new();
        let new_names: std::collections::HashSet<ItemName> =
            new_hosts.iter().map(|h| h.name().clone()).collect();

        for host in new_hosts {
            if let Some(old) = self.hosts.insert(host.name().clone(), host) {
                displaced.push(old);
            }
        }
        // Items removed by the new configuration.
        let stale: Vec<ItemName> = self
            .hosts
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| !new_names.contains(name))
            .collect();
        for name in stale {
            if let Some((_, old)) = self.hosts.remove(&name) {
                displaced.push(old);
            }
        }
        displaced
    }

    pub fn clear(&self) -> Vec<Arc<Host>> {
        let all = self.hosts();
        self.hosts.clear();
        all
    }
}

type ResponseSlot = oneshot::Sender<Result<Option<Envelope>>>;

struct BrokerInner {
    registry: Arc<ServiceRegistry>,
    wal: Arc<Wal>,
    tracer: Tracer,
    pending: DashMap<CorrelationId, ResponseSlot>,
}

/// Message router between hosts. Cheap to clone; hosts receive a handle,
/// never ownership.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Broker {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, wal: Arc<Wal>, tracer: Tracer) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry,
                wal,
                tracer,
                pending: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    /// True when a synchronous caller is blocked on this correlation id.
    #[must_use]
    pub fn has_pending(&self, correlation_id: CorrelationId) -> bool {
        self.inner.pending.contains_key(&correlation_id)
    }

    /// Fire-and-forget delivery: WAL append as enqueued, then queue on the
    /// target. Returns the enqueued message id immediately.
    #[instrument(skip(self, envelope), fields(source = %source, target = %target))]
    pub async fn send_request_async(
        &self,
        source: &ItemName,
        target: &ItemName,
        envelope: Envelope,
    ) -> Result<MessageId> {
        self.route(source, target, envelope).await
    }

    /// Blocking request: allocates a response slot keyed by a fresh
    /// correlation id, enqueues, and awaits the slot up to `timeout`.
    #[instrument(skip(self, envelope), fields(source = %source, target = %target))]
    pub async fn send_request_sync(
        &self,
        source: &ItemName,
        target: &ItemName,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let correlation_id = CorrelationId::generate();
        let envelope = envelope.with_correlation(correlation_id);
        let message_id = envelope.message_id;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);

        if let Err(e) = self.route(source, target, envelope.clone()).await {
            self.inner.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => {
                self.inner.pending.remove(&correlation_id);
                Err(EngineError::internal("response slot dropped"))
            }
            Err(_elapsed) => {
                // Slot cleanup; the request's state becomes failed/timeout.
                self.inner.pending.remove(&correlation_id);
                let failed = envelope.with_state(MessageState::Failed);
                if let Err(wal_err) = self.inner.wal.append(failed).await {
                    warn!(error = %wal_err, %message_id, "wal append failed recording sync timeout");
                }
                Err(EngineError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Resolves a synchronous caller's slot. Called by the worker that
    /// consumed the correlated envelope. A missing slot (timeout already
    /// fired, production stopping) is not an error.
    pub fn send_response(&self, correlation_id: CorrelationId, result: Result<Option<Envelope>>) {
        match self.inner.pending.remove(&correlation_id) {
            Some((_, slot)) => {
                if slot.send(result).is_err() {
                    debug!(%correlation_id, "response slot receiver already gone");
                }
            }
            None => debug!(%correlation_id, "no pending slot for response"),
        }
    }

    /// Cancels every outstanding response slot (production stop).
    pub fn cancel_all_pending(&self) {
        let keys: Vec<CorrelationId> = self
            .inner
            .pending
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for correlation_id in keys {
            if let Some((_, slot)) = self.inner.pending.remove(&correlation_id) {
                let _ = slot.send(Err(EngineError::cancelled("production stopping")));
            }
        }
    }

    /// Dead-letters an envelope: terminal WAL state plus the DLQ trace row.
    pub async fn dead_letter(&self, envelope: &Envelope, reason: &str) {
        let dead = envelope.clone().with_state(MessageState::DeadLettered);
        if let Err(e) = self.inner.wal.append(dead).await {
            warn!(error = %e, message_id = %envelope.message_id, "wal append failed while dead-lettering");
        }
        self.inner
            .tracer
            .dead_letter(envelope, crate::domain::ItemType::Process, reason);
    }

    /// The shared delivery path: hop accounting, loop protection, WAL
    /// append, enqueue under the target's overflow policy.
    async fn route(
        &self,
        source: &ItemName,
        target: &ItemName,
        envelope: Envelope,
    ) -> Result<MessageId> {
        let Some(host) = self.inner.registry.get(target) else {
            let err = EngineError::unknown_target(target.as_str());
            self.dead_letter(&envelope, &err.to_string()).await;
            return Err(err);
        };

        let mut routed = envelope.hopped();
        routed.routing.source = Some(source.clone());
        routed.routing.destination = Some(target.clone());

        let hop_limit = host.hop_limit();
        if routed.routing.hop_count >= hop_limit {
            let err = EngineError::LoopDetected {
                message_id: routed.message_id,
                hops: routed.routing.hop_count,
            };
            self.dead_letter(&routed, &err.to_string()).await;
            return Err(err);
        }

        let message_id = routed.message_id;
        let enqueued = routed.clone().with_state(MessageState::Enqueued);

        // Durability before visibility: the WAL record precedes the enqueue.
        self.inner.wal.append(enqueued.clone()).await?;

        let queue = host.queue();
        match queue.enqueue(enqueued, &host.run_token()).await? {
            EnqueueOutcome::Enqueued => Ok(message_id),
            EnqueueOutcome::DisplacedOldest(old) => {
                self.fail_pending(&old, target);
                self.dead_letter(&old, "overflow").await;
                Ok(message_id)
            }
            EnqueueOutcome::RefusedNewest(new) => {
                self.fail_pending(&new, target);
                self.dead_letter(&new, "overflow").await;
                Ok(message_id)
            }
        }
    }

    /// A dropped message may have a synchronous caller blocked on it;
    /// release them with the queue-full error rather than a timeout.
    fn fail_pending(&self, envelope: &Envelope, target: &ItemName) {
        if let Some(correlation_id) = envelope.correlation_id {
            if self.has_pending(correlation_id) {
                self.send_response(
                    correlation_id,
                    Err(EngineError::QueueFull {
                        item: target.as_str().to_string(),
                    }),
                );
            }
        }
    }
}

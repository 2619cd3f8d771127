//! Bounded message queues
//!
//! Four disciplines behind one type: FIFO (default, required for strict
//! per-host ordering), Priority (by envelope priority, FIFO within a
//! priority), LIFO (freshest first) and Unordered (throughput). All are
//! bounded; what happens at capacity is the host's overflow policy.
//!
//! Producers are the broker, consumers are the host's workers; the queue is
//! internally synchronised and every blocking entry point observes a
//! cancellation token.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{OverflowPolicy, Priority, QueueCapacity, QueueKind};
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};

/// What `enqueue` did under the configured overflow policy.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The message is in the queue.
    Enqueued,
    /// The queue was full; the head was displaced to make room. The caller
    /// owns the displaced message (it is typically dead-lettered).
    DisplacedOldest(Envelope),
    /// The queue was full; the new message was refused.
    RefusedNewest(Envelope),
}

struct PriorityEntry {
    priority: Priority,
    seq: u64,
    envelope: Envelope,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Discipline {
    Fifo(VecDeque<Envelope>),
    Lifo(Vec<Envelope>),
    Priority(BinaryHeap<PriorityEntry>),
    Unordered(VecDeque<Envelope>),
}

impl Discipline {
    fn len(&self) -> usize {
        match self {
            Self::Fifo(q) | Self::Unordered(q) => q.len(),
            Self::Lifo(q) => q.len(),
            Self::Priority(q) => q.len(),
        }
    }
}

/// A bounded, thread-safe message queue owned by one host.
pub struct MessageQueue {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Discipline>,
    seq: AtomicU64,
    items: Notify,
    space: Notify,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

impl MessageQueue {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: QueueKind,
        capacity: QueueCapacity,
        policy: OverflowPolicy,
    ) -> Self {
        let inner = match kind {
            QueueKind::Fifo => Discipline::Fifo(VecDeque::new()),
            QueueKind::Lifo => Discipline::Lifo(Vec::new()),
            QueueKind::Priority => Discipline::Priority(BinaryHeap::new()),
            QueueKind::Unordered => Discipline::Unordered(VecDeque::new()),
        };
        Self {
            name: name.into(),
            capacity: capacity.as_usize(),
            policy,
            inner: Mutex::new(inner),
            seq: AtomicU64::new(0),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking enqueue. Gives the envelope back when the queue is full,
    /// regardless of overflow policy.
    pub fn try_enqueue(&self, envelope: Envelope) -> std::result::Result<(), Envelope> {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.len() >= self.capacity {
            return Err(envelope);
        }
        self.push_locked(&mut inner, envelope);
        drop(inner);
        self.items.notify_one();
        Ok(())
    }

    /// Enqueue under the configured overflow policy.
    ///
    /// With `Block` this waits for space (the only back-pressure mechanism in
    /// the engine); with `Reject` a full queue is a `QueueFull` error; the
    /// drop policies trade data for liveness and report what they dropped.
    pub async fn enqueue(
        &self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<EnqueueOutcome> {
        match self.policy {
            OverflowPolicy::Block => {
                let mut pending = envelope;
                loop {
                    let has_space = self.space.notified();
                    match self.try_enqueue(pending) {
                        Ok(()) => return Ok(EnqueueOutcome::Enqueued),
                        Err(back) => pending = back,
                    }
                    tokio::select! {
                        () = has_space => {}
                        () = cancel.cancelled() => {
                            return Err(EngineError::cancelled(format!(
                                "enqueue on {} cancelled while blocked",
                                self.name
                            )));
                        }
                    }
                }
            }
            OverflowPolicy::DropOldest => {
                let mut inner = self.inner.lock().expect("queue lock");
                let displaced = if inner.len() >= self.capacity {
                    self.pop_locked(&mut inner)
                } else {
                    None
                };
                self.push_locked(&mut inner, envelope);
                drop(inner);
                self.items.notify_one();
                match displaced {
                    Some(old) => {
                        warn!(queue = %self.name, message_id = %old.message_id, "queue full; displaced oldest");
                        Ok(EnqueueOutcome::DisplacedOldest(old))
                    }
                    None => Ok(EnqueueOutcome::Enqueued),
                }
            }
            OverflowPolicy::DropNewest => match self.try_enqueue(envelope) {
                Ok(()) => Ok(EnqueueOutcome::Enqueued),
                Err(refused) => {
                    warn!(queue = %self.name, message_id = %refused.message_id, "queue full; refused newest");
                    Ok(EnqueueOutcome::RefusedNewest(refused))
                }
            },
            OverflowPolicy::Reject => match self.try_enqueue(envelope) {
                Ok(()) => Ok(EnqueueOutcome::Enqueued),
                Err(_refused) => Err(EngineError::QueueFull {
                    item: self.name.clone(),
                }),
            },
        }
    }

    /// Blocking dequeue. Returns `None` when the token is cancelled.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<Envelope> {
        loop {
            let has_items = self.items.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock");
                if let Some(envelope) = self.pop_locked(&mut inner) {
                    drop(inner);
                    self.space.notify_one();
                    return Some(envelope);
                }
            }
            tokio::select! {
                () = has_items => {}
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Drains everything currently queued, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<Envelope> {
        let mut inner = self.inner.lock().expect("queue lock");
        let mut drained = Vec::with_capacity(inner.len());
        while let Some(envelope) = self.pop_locked(&mut inner) {
            drained.push(envelope);
        }
        drop(inner);
        // notify_one stores a permit; notify_waiters would miss a producer
        // that has not polled its wait future yet.
        self.space.notify_one();
        drained
    }

    fn push_locked(&self, inner: &mut Discipline, envelope: Envelope) {
        match inner {
            Discipline::Fifo(q) | Discipline::Unordered(q) => q.push_back(envelope),
            Discipline::Lifo(q) => q.push(envelope),
            Discipline::Priority(q) => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                q.push(PriorityEntry {
                    priority: envelope.priority,
                    seq,
                    envelope,
                });
            }
        }
    }

    #[allow(clippy::unused_self)]
    fn pop_locked(&self, inner: &mut Discipline) -> Option<Envelope> {
        match inner {
            Discipline::Fifo(q) | Discipline::Unordered(q) => q.pop_front(),
            Discipline::Lifo(q) => q.pop(),
            Discipline::Priority(q) => q.pop().map(|entry| entry.envelope),
        }
    }
}

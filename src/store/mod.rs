//! Message store: the queryable projection of the WAL
//!
//! One row per host visit. The store backs the session trace view, message
//! listings, resend and housekeeping. Its durability is deliberately weaker
//! than the WAL's — it can always be rebuilt — so store failures never stall
//! the pipeline: rows go through an out-of-band [`StoreWriter`] that logs and
//! retries.

mod sqlite;

pub use sqlite::SqliteMessageStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::domain::{CorrelationId, Direction, ItemType, MessageId, SessionId};
use crate::error::Result;

/// Distinguished logical sink for dead-lettered messages. Not a routed host.
pub const DEAD_LETTER_SINK: &str = "__dlq__";

/// Visit status values written to trace rows.
pub mod status {
    pub const RECEIVED: &str = "received";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const DEAD_LETTERED: &str = "dead_lettered";
    pub const EXPIRED: &str = "expired";
    pub const DROPPED: &str = "dropped";
}

/// One host visit, as persisted.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    /// Row id; `None` until persisted.
    pub id: Option<i64>,
    pub project_id: String,
    pub item_name: String,
    pub item_type: ItemType,
    pub direction: Direction,
    pub message_id: MessageId,
    pub message_type: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub session_id: Option<SessionId>,
    pub body_class_name: Option<String>,
    pub schema_name: Option<String>,
    pub schema_namespace: Option<String>,
    pub status: String,
    pub raw_content: Option<Vec<u8>>,
    pub content_size: i64,
    pub source_item: Option<String>,
    pub destination_item: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<i64>,
    pub ack_content: Option<Vec<u8>>,
    pub ack_type: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: Option<i64>,
    pub retry_count: i64,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for message listings. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub project_id: Option<String>,
    pub item_name: Option<String>,
    pub direction: Option<Direction>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl MessageFilter {
    #[must_use]
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            limit: 100,
            ..Self::default()
        }
    }
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregated view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub message_types: Vec<String>,
}

/// Queryable projection of the WAL.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts one host visit and returns its row id.
    async fn record_visit(&self, record: &TraceRecord) -> Result<i64>;

    /// Updates the status of every visit row for a message.
    async fn update_message_status(&self, message_id: MessageId, status: &str) -> Result<()>;

    /// Most recent visit row for a message.
    async fn get_message(&self, message_id: MessageId) -> Result<Option<TraceRecord>>;

    /// Filtered, paginated listing ordered by `received_at` descending.
    async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<TraceRecord>>;

    /// All rows for one session, ordered by `received_at` ascending.
    async fn session_trace(&self, session_id: &str) -> Result<Vec<TraceRecord>>;

    /// Aggregated sessions, most recent first.
    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>>;

    /// Housekeeping: deletes rows older than the given number of days.
    /// Returns the count removed.
    async fn delete_older_than(&self, days: u32) -> Result<u64>;
}

/// Out-of-band trace writer.
///
/// The pipeline submits rows here and moves on; a failed insert is logged,
/// retried once, and then dropped — the WAL remains authoritative.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<TraceRecord>,
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter").finish_non_exhaustive()
    }
}

impl StoreWriter {
    /// Spawns the writer task. The task ends when every `StoreWriter` clone
    /// has been dropped and the channel drains.
    #[must_use]
    pub fn spawn(store: Arc<dyn MessageStore>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceRecord>();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(first) = store.record_visit(&record).await {
                    warn!(error = %first, "trace insert failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    if let Err(second) = store.record_visit(&record).await {
                        error!(
                            error = %second,
                            message_id = %record.message_id,
                            "trace insert failed twice; dropping row (WAL remains authoritative)"
                        );
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Queues one row. Never blocks and never fails the caller.
    pub fn submit(&self, record: TraceRecord) {
        if self.tx.send(record).is_err() {
            warn!("store writer is gone; trace row dropped");
        }
    }
}

//! `SQLite` implementation of the message store
//!
//! Rows live in the `message_trace` table created by the migration system
//! during `DatabaseConnection::initialize()`. Indexes cover the hot paths:
//! `(project_id, received_at desc)` for listings, `session_id` for traces,
//! `correlation_id` and `message_id` for correlation lookups.
//!
//! Queries are static SQL with null-tolerant predicates rather than
//! dynamically assembled strings.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use std::str::FromStr;
use tracing::{instrument, warn};

use crate::database::DatabaseConnection;
use crate::domain::{CorrelationId, Direction, ItemType, MessageId, SessionId};
use crate::error::{EngineError, Result};

use super::{MessageFilter, MessageStore, SessionFilter, SessionSummary, TraceRecord};

const INSERT_VISIT: &str = r"
INSERT INTO message_trace (
    project_id, item_name, item_type, direction, message_id, message_type,
    correlation_id, session_id, body_class_name, schema_name, schema_namespace,
    status, raw_content, content_size, source_item, destination_item,
    remote_host, remote_port, ack_content, ack_type, error_message,
    latency_ms, retry_count, received_at, completed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
";

const UPDATE_MESSAGE_STATUS: &str = r"
UPDATE message_trace SET status = ?2 WHERE message_id = ?1;
";

const SELECT_LATEST_BY_MESSAGE: &str = r"
SELECT * FROM message_trace
WHERE message_id = ?
ORDER BY received_at DESC, id DESC
LIMIT 1;
";

const SELECT_MESSAGES: &str = r"
SELECT * FROM message_trace
WHERE (?1 IS NULL OR project_id = ?1)
  AND (?2 IS NULL OR item_name = ?2)
  AND (?3 IS NULL OR direction = ?3)
  AND (?4 IS NULL OR status = ?4)
  AND (?5 IS NULL OR received_at >= ?5)
  AND (?6 IS NULL OR received_at <= ?6)
ORDER BY received_at DESC, id DESC
LIMIT ?7 OFFSET ?8;
";

const SELECT_SESSION_TRACE: &str = r"
SELECT * FROM message_trace
WHERE session_id = ?
ORDER BY received_at ASC, id ASC;
";

const SELECT_SESSIONS: &str = r"
SELECT session_id,
       COUNT(*) AS message_count,
       MIN(received_at) AS started_at,
       MAX(COALESCE(completed_at, received_at)) AS ended_at,
       AVG(CASE WHEN status = 'failed' THEN 0.0 ELSE 1.0 END) AS success_rate,
       GROUP_CONCAT(DISTINCT message_type) AS message_types
FROM message_trace
WHERE session_id IS NOT NULL
  AND (?1 IS NULL OR project_id = ?1)
  AND (?2 IS NULL OR received_at >= ?2)
  AND (?3 IS NULL OR received_at <= ?3)
GROUP BY session_id
ORDER BY started_at DESC
LIMIT ?4 OFFSET ?5;
";

const DELETE_OLDER_THAN: &str = r"
DELETE FROM message_trace WHERE received_at < ?;
";

/// `SQLite`-backed message store.
pub struct SqliteMessageStore {
    connection: DatabaseConnection,
}

impl std::fmt::Debug for SqliteMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMessageStore").finish_non_exhaustive()
    }
}

impl SqliteMessageStore {
    /// The provided connection must already be initialised (migrations run).
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn millis(ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis()
    }

    fn from_millis(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Reconstructs a `TraceRecord` from a row.
    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<TraceRecord> {
        let item_type_str: String = row.get("item_type");
        let direction_str: String = row.get("direction");
        let message_id_str: String = row.get("message_id");

        let item_type = ItemType::from_str(&item_type_str)
            .map_err(EngineError::store_unavailable)?;
        let direction = Direction::from_str(&direction_str)
            .map_err(EngineError::store_unavailable)?;
        let message_id = uuid::Uuid::parse_str(&message_id_str)
            .map(MessageId::new)
            .map_err(|e| {
                EngineError::store_unavailable(format!(
                    "invalid message id '{message_id_str}': {e}"
                ))
            })?;

        let correlation_id = row
            .get::<Option<String>, _>("correlation_id")
            .map(|s| {
                uuid::Uuid::parse_str(&s).map(CorrelationId::new).map_err(|e| {
                    EngineError::store_unavailable(format!("invalid correlation id '{s}': {e}"))
                })
            })
            .transpose()?;

        let session_id = row
            .get::<Option<String>, _>("session_id")
            .map(|s| {
                SessionId::try_new(s.clone()).map_err(|e| {
                    EngineError::store_unavailable(format!("invalid session id '{s}': {e}"))
                })
            })
            .transpose()?;

        Ok(TraceRecord {
            id: Some(row.get("id")),
            project_id: row.get("project_id"),
            item_name: row.get("item_name"),
            item_type,
            direction,
            message_id,
            message_type: row.get("message_type"),
            correlation_id,
            session_id,
            body_class_name: row.get("body_class_name"),
            schema_name: row.get("schema_name"),
            schema_namespace: row.get("schema_namespace"),
            status: row.get("status"),
            raw_content: row.get("raw_content"),
            content_size: row.get("content_size"),
            source_item: row.get("source_item"),
            destination_item: row.get("destination_item"),
            remote_host: row.get("remote_host"),
            remote_port: row.get("remote_port"),
            ack_content: row.get("ack_content"),
            ack_type: row.get("ack_type"),
            error_message: row.get("error_message"),
            latency_ms: row.get("latency_ms"),
            retry_count: row.get("retry_count"),
            received_at: Self::from_millis(row.get("received_at")),
            completed_at: row
                .get::<Option<i64>, _>("completed_at")
                .map(Self::from_millis),
        })
    }

    fn storage_error(e: sqlx::Error) -> EngineError {
        EngineError::store_unavailable(e.to_string())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, record), fields(message_id = %record.message_id, item = %record.item_name))]
    async fn record_visit(&self, record: &TraceRecord) -> Result<i64> {
        let result = sqlx::query(INSERT_VISIT)
            .bind(&record.project_id)
            .bind(&record.item_name)
            .bind(record.item_type.as_str())
            .bind(record.direction.as_str())
            .bind(record.message_id.to_string())
            .bind(&record.message_type)
            .bind(record.correlation_id.as_ref().map(ToString::to_string))
            .bind(record.session_id.as_ref().map(ToString::to_string))
            .bind(&record.body_class_name)
            .bind(&record.schema_name)
            .bind(&record.schema_namespace)
            .bind(&record.status)
            .bind(&record.raw_content)
            .bind(record.content_size)
            .bind(&record.source_item)
            .bind(&record.destination_item)
            .bind(&record.remote_host)
            .bind(record.remote_port)
            .bind(&record.ack_content)
            .bind(&record.ack_type)
            .bind(&record.error_message)
            .bind(record.latency_ms)
            .bind(record.retry_count)
            .bind(Self::millis(record.received_at))
            .bind(record.completed_at.map(Self::millis))
            .execute(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        Ok(result.last_insert_rowid())
    }

    #[instrument(skip(self))]
    async fn update_message_status(&self, message_id: MessageId, status: &str) -> Result<()> {
        let result = sqlx::query(UPDATE_MESSAGE_STATUS)
            .bind(message_id.to_string())
            .bind(status)
            .execute(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        if result.rows_affected() == 0 {
            warn!(%message_id, "status update matched no trace rows");
        }
        Ok(())
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Option<TraceRecord>> {
        let row = sqlx::query(SELECT_LATEST_BY_MESSAGE)
            .bind(message_id.to_string())
            .fetch_optional(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        row.map(|r| Self::parse_row(&r)).transpose()
    }

    async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<TraceRecord>> {
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let rows = sqlx::query(SELECT_MESSAGES)
            .bind(&filter.project_id)
            .bind(&filter.item_name)
            .bind(filter.direction.map(|d| d.as_str()))
            .bind(&filter.status)
            .bind(filter.since.map(Self::millis))
            .bind(filter.until.map(Self::millis))
            .bind(limit)
            .bind(filter.offset.max(0))
            .fetch_all(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        rows.iter().map(Self::parse_row).collect()
    }

    async fn session_trace(&self, session_id: &str) -> Result<Vec<TraceRecord>> {
        let rows = sqlx::query(SELECT_SESSION_TRACE)
            .bind(session_id)
            .fetch_all(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        rows.iter().map(Self::parse_row).collect()
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>> {
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let rows = sqlx::query(SELECT_SESSIONS)
            .bind(&filter.project_id)
            .bind(filter.since.map(Self::millis))
            .bind(filter.until.map(Self::millis))
            .bind(limit)
            .bind(filter.offset.max(0))
            .fetch_all(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                let types: Option<String> = row.get("message_types");
                SessionSummary {
                    session_id: row.get("session_id"),
                    message_count: row.get("message_count"),
                    started_at: Self::from_millis(row.get("started_at")),
                    ended_at: row.get::<Option<i64>, _>("ended_at").map(Self::from_millis),
                    success_rate: row.get("success_rate"),
                    message_types: types
                        .map(|t| t.split(',').map(str::to_string).collect())
                        .unwrap_or_default(),
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let result = sqlx::query(DELETE_OLDER_THAN)
            .bind(Self::millis(cutoff))
            .execute(self.connection.pool())
            .await
            .map_err(Self::storage_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use crate::store::status;

    async fn store() -> (tempfile::TempDir, SqliteMessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = DatabasePath::parse(dir.path().join("trace.db")).unwrap();
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
            .await
            .unwrap();
        (dir, SqliteMessageStore::new(conn))
    }

    fn visit(session: &SessionId, item: &str, direction: Direction) -> TraceRecord {
        TraceRecord {
            id: None,
            project_id: "demo".to_string(),
            item_name: item.to_string(),
            item_type: ItemType::Service,
            direction,
            message_id: MessageId::generate(),
            message_type: Some("ADT^A01".to_string()),
            correlation_id: None,
            session_id: Some(session.clone()),
            body_class_name: Some("hl7.message".to_string()),
            schema_name: Some("ADT_A01".to_string()),
            schema_namespace: Some("urn:hl7-org:v2".to_string()),
            status: status::COMPLETED.to_string(),
            raw_content: Some(b"MSH|...".to_vec()),
            content_size: 7,
            source_item: None,
            destination_item: None,
            remote_host: None,
            remote_port: None,
            ack_content: None,
            ack_type: None,
            error_message: None,
            latency_ms: Some(3),
            retry_count: 0,
            received_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[test_log::test(tokio::test)]
    async fn insert_and_fetch_round_trips() {
        let (_dir, store) = store().await;
        let session = SessionId::ingress();
        let record = visit(&session, "HL7.In", Direction::Inbound);

        let id = store.record_visit(&record).await.unwrap();
        assert!(id > 0);

        let fetched = store.get_message(record.message_id).await.unwrap().unwrap();
        assert_eq!(fetched.item_name, "HL7.In");
        assert_eq!(fetched.session_id, Some(session));
        assert_eq!(fetched.raw_content.as_deref(), Some(&b"MSH|..."[..]));
    }

    #[test_log::test(tokio::test)]
    async fn session_trace_is_ordered() {
        let (_dir, store) = store().await;
        let session = SessionId::ingress();

        let mut first = visit(&session, "HL7.In", Direction::Inbound);
        first.received_at = Utc::now() - chrono::Duration::seconds(2);
        let mut second = visit(&session, "HL7.Router", Direction::Internal);
        second.received_at = Utc::now() - chrono::Duration::seconds(1);
        let third = visit(&session, "HL7.Out", Direction::Outbound);

        // Insert out of order; read back ordered.
        store.record_visit(&third).await.unwrap();
        store.record_visit(&first).await.unwrap();
        store.record_visit(&second).await.unwrap();

        let trace = store.session_trace(session.as_str()).await.unwrap();
        let items: Vec<&str> = trace.iter().map(|r| r.item_name.as_str()).collect();
        assert_eq!(items, vec!["HL7.In", "HL7.Router", "HL7.Out"]);
    }

    #[test_log::test(tokio::test)]
    async fn list_messages_filters_by_direction_and_status() {
        let (_dir, store) = store().await;
        let session = SessionId::ingress();

        store
            .record_visit(&visit(&session, "HL7.In", Direction::Inbound))
            .await
            .unwrap();
        let mut failed = visit(&session, "HL7.Out", Direction::Outbound);
        failed.status = status::FAILED.to_string();
        store.record_visit(&failed).await.unwrap();

        let filter = MessageFilter {
            direction: Some(Direction::Outbound),
            status: Some(status::FAILED.to_string()),
            ..MessageFilter::for_project("demo")
        };
        let rows = store.list_messages(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_name, "HL7.Out");
    }

    #[test_log::test(tokio::test)]
    async fn session_summary_aggregates() {
        let (_dir, store) = store().await;
        let session = SessionId::ingress();

        store
            .record_visit(&visit(&session, "HL7.In", Direction::Inbound))
            .await
            .unwrap();
        store
            .record_visit(&visit(&session, "HL7.Out.A", Direction::Outbound))
            .await
            .unwrap();
        store
            .record_visit(&visit(&session, "HL7.Out.B", Direction::Outbound))
            .await
            .unwrap();

        let sessions = store
            .list_sessions(&SessionFilter {
                project_id: Some("demo".to_string()),
                ..SessionFilter::default()
            })
            .await
            .unwrap();

        assert_eq!(sessions.len(), 1);
        let summary = &sessions[0];
        assert_eq!(summary.session_id, session.as_str());
        assert_eq!(summary.message_count, 3);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(summary.message_types, vec!["ADT^A01".to_string()]);
    }

    #[test_log::test(tokio::test)]
    async fn update_status_touches_all_rows_for_message() {
        let (_dir, store) = store().await;
        let session = SessionId::ingress();
        let record = visit(&session, "HL7.Out", Direction::Outbound);
        store.record_visit(&record).await.unwrap();

        store
            .update_message_status(record.message_id, status::DEAD_LETTERED)
            .await
            .unwrap();

        let fetched = store.get_message(record.message_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, status::DEAD_LETTERED);
    }

    #[test_log::test(tokio::test)]
    async fn housekeeping_deletes_old_rows() {
        let (_dir, store) = store().await;
        let session = SessionId::ingress();

        let mut old = visit(&session, "HL7.In", Direction::Inbound);
        old.received_at = Utc::now() - chrono::Duration::days(30);
        store.record_visit(&old).await.unwrap();
        store
            .record_visit(&visit(&session, "HL7.In", Direction::Inbound))
            .await
            .unwrap();

        let removed = store.delete_older_than(7).await.unwrap();
        assert_eq!(removed, 1);
    }
}

//! Session tracing
//!
//! The session id is minted once, at the first inbound host, and rides the
//! envelope unchanged from there. Every host visit appends one trace row to
//! the message store; those rows are the sole source of the end-to-end
//! sequence view.

use chrono::Utc;
use std::time::Instant;
use tracing::warn;

use crate::domain::{Direction, ItemName, ItemType};
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::store::{DEAD_LETTER_SINK, StoreWriter, TraceRecord, status};

/// Per-production tracer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Tracer {
    project_id: String,
    writer: StoreWriter,
}

impl Tracer {
    #[must_use]
    pub fn new(project_id: impl Into<String>, writer: StoreWriter) -> Self {
        Self {
            project_id: project_id.into(),
            writer,
        }
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Begins one host visit. The returned [`Visit`] owns the row and writes
    /// it when finished.
    #[must_use]
    pub fn start_visit(
        &self,
        envelope: &Envelope,
        item: &ItemName,
        item_type: ItemType,
        direction: Direction,
    ) -> Visit {
        let record = TraceRecord {
            id: None,
            project_id: self.project_id.clone(),
            item_name: item.as_str().to_string(),
            item_type,
            direction,
            message_id: envelope.message_id,
            message_type: envelope.message_type.clone(),
            correlation_id: envelope.correlation_id,
            session_id: envelope.session_id.clone(),
            body_class_name: Some(envelope.body_class_name.clone()),
            schema_name: envelope.payload.schema_name.clone(),
            schema_namespace: envelope.payload.schema_namespace.clone(),
            status: status::RECEIVED.to_string(),
            raw_content: Some(envelope.payload.raw.clone()),
            content_size: i64::try_from(envelope.payload.raw.len()).unwrap_or(i64::MAX),
            source_item: envelope.routing.source.as_ref().map(|s| s.as_str().to_string()),
            destination_item: envelope
                .routing
                .destination
                .as_ref()
                .map(|d| d.as_str().to_string()),
            remote_host: None,
            remote_port: None,
            ack_content: None,
            ack_type: None,
            error_message: None,
            latency_ms: None,
            retry_count: i64::from(envelope.retry_count),
            received_at: Utc::now(),
            completed_at: None,
        };
        Visit {
            record,
            started: Instant::now(),
            writer: self.writer.clone(),
        }
    }

    /// Writes the dead-letter row for an envelope. The DLQ is a logical
    /// sink, not a routed host.
    pub fn dead_letter(&self, envelope: &Envelope, item_type: ItemType, reason: &str) {
        let now = Utc::now();
        self.writer.submit(TraceRecord {
            id: None,
            project_id: self.project_id.clone(),
            item_name: envelope
                .routing
                .source
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |s| s.as_str().to_string()),
            item_type,
            direction: Direction::Internal,
            message_id: envelope.message_id,
            message_type: envelope.message_type.clone(),
            correlation_id: envelope.correlation_id,
            session_id: envelope.session_id.clone(),
            body_class_name: Some(envelope.body_class_name.clone()),
            schema_name: envelope.payload.schema_name.clone(),
            schema_namespace: envelope.payload.schema_namespace.clone(),
            status: status::DEAD_LETTERED.to_string(),
            raw_content: Some(envelope.payload.raw.clone()),
            content_size: i64::try_from(envelope.payload.raw.len()).unwrap_or(i64::MAX),
            source_item: envelope.routing.source.as_ref().map(|s| s.as_str().to_string()),
            destination_item: Some(DEAD_LETTER_SINK.to_string()),
            remote_host: None,
            remote_port: None,
            ack_content: None,
            ack_type: None,
            error_message: Some(reason.to_string()),
            latency_ms: None,
            retry_count: i64::from(envelope.retry_count),
            received_at: now,
            completed_at: Some(now),
        });
        warn!(message_id = %envelope.message_id, reason, "message dead-lettered");
    }
}

/// One in-flight host visit.
#[derive(Debug)]
pub struct Visit {
    record: TraceRecord,
    started: Instant,
    writer: StoreWriter,
}

impl Visit {
    /// Records the remote endpoint for outbound visits.
    pub fn set_remote(&mut self, host: impl Into<String>, port: u16) {
        self.record.remote_host = Some(host.into());
        self.record.remote_port = Some(i64::from(port));
    }

    /// Attaches the raw acknowledgement exchanged with the remote.
    pub fn set_ack(&mut self, ack_content: Vec<u8>, ack_type: impl Into<String>) {
        self.record.ack_content = Some(ack_content);
        self.record.ack_type = Some(ack_type.into());
    }

    /// Records only the acknowledgement code, not its bytes (hosts without
    /// `archive_io`).
    pub fn set_ack_type(&mut self, ack_type: impl Into<String>) {
        self.record.ack_type = Some(ack_type.into());
    }

    /// Successful completion.
    pub fn complete(self) {
        self.finish(status::COMPLETED, None);
    }

    /// Committed, but with a warning attached (the `W` reply action).
    pub fn complete_with_warning(self, warning: impl Into<String>) {
        self.finish(status::COMPLETED, Some(warning.into()));
    }

    /// The message was consumed by a `delete` rule.
    pub fn dropped(self, rule: impl Into<String>) {
        self.finish(status::DROPPED, Some(rule.into()));
    }

    /// The message expired before processing.
    pub fn expired(self) {
        self.finish(status::EXPIRED, None);
    }

    pub fn fail(self, error: &EngineError) {
        let message = error.to_string();
        self.finish(status::FAILED, Some(message));
    }

    pub fn finish(mut self, visit_status: &str, error_message: Option<String>) {
        let elapsed = self.started.elapsed();
        self.record.status = visit_status.to_string();
        self.record.error_message = error_message;
        self.record.latency_ms = Some(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        self.record.completed_at = Some(Utc::now());
        self.writer.submit(self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::domain::SessionId;
    use crate::envelope::Payload;
    use crate::store::{MessageStore, SessionFilter, SqliteMessageStore};
    use std::sync::Arc;

    async fn tracer_with_store() -> (tempfile::TempDir, Tracer, Arc<SqliteMessageStore>) {
        let dir = tempfile::tempdir().unwrap();
        let path = DatabasePath::parse(dir.path().join("trace.db")).unwrap();
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
            .await
            .unwrap();
        let store = Arc::new(SqliteMessageStore::new(conn));
        let (writer, _handle) = StoreWriter::spawn(Arc::clone(&store) as Arc<dyn MessageStore>);
        (dir, Tracer::new("demo", writer), store)
    }

    fn inbound_envelope() -> Envelope {
        Envelope::new("hl7.message", Payload::hl7(b"MSH|^~\\&|A|B".to_vec()))
            .with_session(SessionId::ingress())
            .with_message_type("ADT^A01")
    }

    async fn settle() {
        // Writer is out of band; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    #[test_log::test(tokio::test)]
    async fn visit_rows_share_the_session() {
        let (_dir, tracer, store) = tracer_with_store().await;
        let env = inbound_envelope();
        let item = crate::domain::ItemName::try_new("HL7.In".to_string()).unwrap();

        tracer
            .start_visit(&env, &item, ItemType::Service, Direction::Inbound)
            .complete();
        tracer
            .start_visit(&env, &item, ItemType::Service, Direction::Internal)
            .complete();
        settle().await;

        let rows = store
            .session_trace(env.session_id.as_ref().unwrap().as_str())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.session_id == env.session_id));
        assert!(rows.iter().all(|r| r.status == status::COMPLETED));
        assert!(rows.iter().all(|r| r.latency_ms.is_some()));
    }

    #[test_log::test(tokio::test)]
    async fn dead_letter_rows_target_the_sink() {
        let (_dir, tracer, store) = tracer_with_store().await;
        let env = inbound_envelope();

        tracer.dead_letter(&env, ItemType::Process, "LoopDetected");
        settle().await;

        let row = store.get_message(env.message_id).await.unwrap().unwrap();
        assert_eq!(row.status, status::DEAD_LETTERED);
        assert_eq!(row.destination_item.as_deref(), Some(DEAD_LETTER_SINK));
        assert_eq!(row.error_message.as_deref(), Some("LoopDetected"));
    }

    #[test_log::test(tokio::test)]
    async fn failed_visits_carry_the_error() {
        let (_dir, tracer, store) = tracer_with_store().await;
        let env = inbound_envelope();
        let item = crate::domain::ItemName::try_new("HL7.Out".to_string()).unwrap();

        let visit = tracer.start_visit(&env, &item, ItemType::Operation, Direction::Outbound);
        visit.fail(&EngineError::Timeout { timeout_ms: 500 });
        settle().await;

        let row = store.get_message(env.message_id).await.unwrap().unwrap();
        assert_eq!(row.status, status::FAILED);
        assert!(row.error_message.unwrap().contains("timed out"));
    }

    #[test_log::test(tokio::test)]
    async fn session_summary_counts_visits() {
        let (_dir, tracer, store) = tracer_with_store().await;
        let env = inbound_envelope();
        let item = crate::domain::ItemName::try_new("HL7.In".to_string()).unwrap();

        tracer
            .start_visit(&env, &item, ItemType::Service, Direction::Inbound)
            .complete();
        settle().await;

        let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].message_count, 1);
    }
}

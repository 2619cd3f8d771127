//! Envelope and payload model
//!
//! The envelope is the immutable record identifying and describing one
//! message instance as it moves through a production. Envelopes are values:
//! every mutation produces a new envelope via the `with_*` methods; the old
//! value is discarded or archived. The payload's raw bytes are authoritative;
//! parsed views are lazy and transient.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{
    CorrelationId, DeliveryMode, ItemName, MessageId, MessageState, Priority, SessionId,
};

/// Serde helper: raw payload bytes as base64 so WAL records stay readable.
mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Routing state carried on every envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    /// Name of the emitting host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ItemName>,

    /// Name of the intended target host. Empty at ingress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<ItemName>,

    /// Identifier of the routing rule that selected this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,

    /// Incremented on every re-enqueue; checked against the hop limit.
    pub hop_count: u32,
}

/// Compliance metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Governance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<String>,
}

/// Immutable byte content plus schema tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Authoritative content.
    #[serde(with = "b64")]
    pub raw: Vec<u8>,

    /// MIME type of `raw`.
    pub content_type: String,

    /// Character encoding of `raw`. The engine never transcodes.
    pub encoding: String,

    /// Payload schema identifier, e.g. `ADT_A01`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,

    /// Schema namespace URI, e.g. `urn:hl7-org:v2`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_namespace: Option<String>,

    /// Parsed fields cached on demand. Transient: not part of identity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Payload {
    /// HL7 v2 payload with the conventional content type and encoding.
    #[must_use]
    pub fn hl7(raw: Vec<u8>) -> Self {
        Self {
            raw,
            content_type: "x-application/hl7-v2+er7".to_string(),
            encoding: "UTF-8".to_string(),
            schema_name: None,
            schema_namespace: Some("urn:hl7-org:v2".to_string()),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// The immutable message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,

    /// Shared between a request and its response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// `message_id` of the message that produced this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<MessageId>,

    /// Set once at ingress; never rewritten downstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    /// Logical protocol type, e.g. `ADT^A01`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    /// Registry key of the processor class handling this envelope. Changes
    /// only at transform boundaries.
    pub body_class_name: String,

    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    pub delivery_mode: DeliveryMode,

    pub routing: Routing,

    #[serde(default)]
    pub governance: Governance,

    pub state: MessageState,

    pub payload: Payload,
}

impl Envelope {
    /// Creates a received envelope around a payload.
    #[must_use]
    pub fn new(body_class_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            message_id: MessageId::generate(),
            correlation_id: None,
            causation_id: None,
            session_id: None,
            created_at: Utc::now(),
            expires_at: None,
            ttl_ms: None,
            message_type: None,
            body_class_name: body_class_name.into(),
            priority: Priority::Normal,
            tags: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            retry_delay_ms: 0,
            delivery_mode: DeliveryMode::AtLeastOnce,
            routing: Routing::default(),
            governance: Governance::default(),
            state: MessageState::Received,
            payload,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: ItemName) -> Self {
        self.routing.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_destination(mut self, destination: ItemName) -> Self {
        self.routing.destination = Some(destination);
        self
    }

    #[must_use]
    pub fn with_route_id(mut self, route_id: impl Into<String>) -> Self {
        self.routing.route_id = Some(route_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: MessageState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.ttl_ms = Some(millis);
        self.expires_at = Some(self.created_at + Duration::milliseconds(millis as i64));
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// A new envelope caused by this one: fresh identity, same session,
    /// `causation_id` pointing back, hop count carried forward.
    #[must_use]
    pub fn child(&self, body_class_name: impl Into<String>, payload: Payload) -> Self {
        let mut child = Self::new(body_class_name, payload);
        child.causation_id = Some(self.message_id);
        child.session_id = self.session_id.clone();
        child.message_type = self.message_type.clone();
        child.priority = self.priority;
        child.delivery_mode = self.delivery_mode;
        child.governance = self.governance.clone();
        child.routing.hop_count = self.routing.hop_count;
        child
    }

    /// An identical copy under a fresh `message_id`, caused by this one.
    /// Used when a rule fans one message out to several targets.
    #[must_use]
    pub fn fork(&self) -> Self {
        let mut copy = self.clone();
        copy.message_id = MessageId::generate();
        copy.causation_id = Some(self.message_id);
        copy
    }

    /// Next hop along the routing chain. Hop counts are monotonically
    /// non-decreasing along a causation chain; the broker enforces the limit.
    #[must_use]
    pub fn hopped(&self) -> Self {
        let mut next = self.clone();
        next.routing.hop_count += 1;
        next
    }

    /// The same message, one delivery attempt later.
    #[must_use]
    pub fn next_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

//! Concrete host implementations
//!
//! The class registry maps an item's `class_name` to a behaviour factory.
//! Host kinds are a compile-time set; the string key exists only so
//! production documents can select among them.

mod expr;
mod hl7_operation;
mod hl7_router;
mod hl7_service;

pub use expr::Condition;
pub use hl7_operation::{Hl7OperationBehaviour, Hl7OperationSettings, ReplyAction, ReplyCodeActions};
pub use hl7_router::{Hl7RouterBehaviour, Hl7RouterSettings, RoutingRuleConfig, RuleAction};
pub use hl7_service::{Hl7ServiceBehaviour, Hl7ServiceSettings};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::config::Item;
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::host::{HostBehaviour, ProcessOutcome};

/// Body class of a decoded HL7 v2 message.
pub const HL7_BODY_CLASS: &str = "hl7.v2.Message";
/// Body class of an acknowledgement view.
pub const HL7_ACK_BODY_CLASS: &str = "hl7.v2.Ack";
/// Body class of bytes that failed decoding.
pub const BAD_MESSAGE_BODY_CLASS: &str = "hermes.BadMessage";

/// Builds the behaviour for an item from its `class_name`.
pub fn build_behaviour(item: &Item) -> Result<Arc<dyn HostBehaviour>> {
    match item.class_name.as_str() {
        "hl7.tcp_service" => Ok(Arc::new(Hl7ServiceBehaviour::from_item(item)?)),
        "hl7.tcp_operation" => Ok(Arc::new(Hl7OperationBehaviour::from_item(item)?)),
        "hl7.router" => Ok(Arc::new(Hl7RouterBehaviour::from_item(item)?)),
        "passthrough" => Ok(Arc::new(PassThroughBehaviour)),
        other => Err(EngineError::InvalidConfig {
            items: vec![format!("item '{}': unknown class_name '{other}'", item.name)],
        }),
    }
}

/// A named payload transform invoked by routing rules.
pub trait Transform: Send + Sync {
    fn apply(&self, envelope: &Envelope) -> Result<Envelope>;
}

struct IdentityTransform;

impl Transform for IdentityTransform {
    fn apply(&self, envelope: &Envelope) -> Result<Envelope> {
        Ok(envelope.fork())
    }
}

static TRANSFORMS: LazyLock<RwLock<HashMap<String, Arc<dyn Transform>>>> = LazyLock::new(|| {
    let mut map: HashMap<String, Arc<dyn Transform>> = HashMap::new();
    map.insert("identity".to_string(), Arc::new(IdentityTransform));
    RwLock::new(map)
});

/// Registers a transform under a name, replacing any previous registration.
pub fn register_transform(name: impl Into<String>, transform: Arc<dyn Transform>) {
    TRANSFORMS
        .write()
        .expect("transform registry lock")
        .insert(name.into(), transform);
}

/// Looks up a registered transform.
#[must_use]
pub fn transform(name: &str) -> Option<Arc<dyn Transform>> {
    TRANSFORMS
        .read()
        .expect("transform registry lock")
        .get(name)
        .map(Arc::clone)
}

/// Forwards every message to the configured targets unchanged. Useful as a
/// minimal process host and in tests.
pub struct PassThroughBehaviour;

impl std::fmt::Debug for PassThroughBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PassThroughBehaviour")
    }
}

#[async_trait]
impl HostBehaviour for PassThroughBehaviour {
    async fn process(&self, envelope: Envelope) -> Result<ProcessOutcome> {
        Ok(ProcessOutcome::Forward(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ItemType;

    fn item(class_name: &str) -> Item {
        Item {
            name: "X".to_string(),
            item_type: ItemType::Process,
            class_name: class_name.to_string(),
            enabled: true,
            pool_size: None,
            adapter_settings: serde_json::Map::new(),
            host_settings: crate::config::HostSettings::default(),
        }
    }

    #[test_log::test]
    fn unknown_class_is_invalid_config() {
        let err = build_behaviour(&item("no.such.class")).err().unwrap();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test_log::test]
    fn passthrough_and_router_resolve() {
        assert!(build_behaviour(&item("passthrough")).is_ok());
        assert!(build_behaviour(&item("hl7.router")).is_ok());
    }

    #[test_log::test]
    fn identity_transform_is_builtin() {
        let t = transform("identity").unwrap();
        let env = Envelope::new(HL7_BODY_CLASS, crate::envelope::Payload::hl7(b"MSH|".to_vec()));
        let out = t.apply(&env).unwrap();
        assert_ne!(out.message_id, env.message_id);
        assert_eq!(out.payload.raw, env.payload.raw);
        assert!(transform("missing").is_none());
    }
}

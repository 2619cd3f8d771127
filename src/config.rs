//! Production configuration documents
//!
//! A production is an ordered collection of items; each item names the host
//! implementation that runs it (`class_name`), its adapter settings (opaque
//! map, interpreted by the host) and the recognised host settings. Documents
//! are validated at the boundary: a `deploy` with an invalid document fails
//! with `InvalidConfig` listing every offending item.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::domain::{
    AckMode, ExecutionMode, HopLimit, ItemName, ItemType, MaxRestarts, MaxRetries,
    MessagingPattern, Millis, OverflowPolicy, QueueCapacity, QueueKind, RestartPolicy,
};
use crate::error::{EngineError, Result};

fn default_true() -> bool {
    true
}

/// Recognised host settings, shared by every host kind. Missing fields take
/// the defaults below; out-of-range values fail at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Downstream item names, in dispatch order.
    pub target_config_names: Vec<String>,

    pub execution_mode: ExecutionMode,

    /// Overrides `pool_size` when set.
    pub worker_count: Option<usize>,

    pub queue_type: QueueKind,
    pub queue_size: QueueCapacity,
    pub overflow_strategy: OverflowPolicy,

    pub restart_policy: RestartPolicy,
    pub max_restarts: MaxRestarts,
    pub restart_delay_ms: Millis,

    pub messaging_pattern: MessagingPattern,
    pub message_timeout_ms: Millis,

    /// Inbound HL7 hosts only.
    pub ack_mode: AckMode,

    /// Outbound HL7 hosts only; see the reply-code mini-language.
    pub reply_code_actions: Option<String>,

    /// Target item receiving messages that fail decoding.
    pub bad_message_handler: Option<String>,

    pub hop_limit: HopLimit,
    pub drain_timeout_ms: Millis,

    /// Processes may opt in to cyclic topologies.
    pub allow_cycles: bool,

    pub max_retries: MaxRetries,
    pub retry_interval_ms: Millis,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            target_config_names: Vec::new(),
            execution_mode: ExecutionMode::default(),
            worker_count: None,
            queue_type: QueueKind::default(),
            queue_size: QueueCapacity::default(),
            overflow_strategy: OverflowPolicy::default(),
            restart_policy: RestartPolicy::default(),
            max_restarts: MaxRestarts::default(),
            restart_delay_ms: Millis::try_new(5_000).expect("within range"),
            messaging_pattern: MessagingPattern::default(),
            message_timeout_ms: Millis::default(),
            ack_mode: AckMode::default(),
            reply_code_actions: None,
            bad_message_handler: None,
            hop_limit: HopLimit::default(),
            drain_timeout_ms: Millis::try_new(10_000).expect("within range"),
            allow_cycles: false,
            max_retries: MaxRetries::default(),
            retry_interval_ms: Millis::try_new(1_000).expect("within range"),
        }
    }
}

/// One configured host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub item_type: ItemType,

    /// Registry key selecting the host implementation.
    pub class_name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Interpreted by the concrete host (port, addresses, timeouts, ...).
    #[serde(default)]
    pub adapter_settings: serde_json::Map<String, Value>,

    #[serde(default)]
    pub host_settings: HostSettings,
}

impl Item {
    pub fn item_name(&self) -> Result<ItemName> {
        ItemName::try_new(self.name.clone())
            .map_err(|e| EngineError::validation(format!("item name '{}': {e}", self.name)))
    }

    /// `worker_count` wins over `pool_size`; one worker by default.
    #[must_use]
    pub fn effective_pool_size(&self) -> usize {
        self.host_settings
            .worker_count
            .or(self.pool_size)
            .unwrap_or(1)
            .max(1)
    }

    /// Deserialises the adapter settings map into a typed settings struct.
    pub fn adapter<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.adapter_settings.clone())).map_err(|e| {
            EngineError::validation(format!("item '{}' adapter settings: {e}", self.name))
        })
    }

    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.host_settings.target_config_names
    }
}

/// The production document consumed by `deploy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionDocument {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub items: Vec<Item>,
}

impl ProductionDocument {
    #[must_use]
    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.name == name)
    }

    /// Enabled items in dependency start order: Operations, then Processes,
    /// then Services. Downstream must be ready before upstream accepts
    /// traffic.
    #[must_use]
    pub fn ordered_for_start(&self) -> Vec<&Item> {
        let rank = |item: &Item| match item.item_type {
            ItemType::Operation => 0,
            ItemType::Process => 1,
            ItemType::Service => 2,
        };
        let mut items: Vec<&Item> = self.items.iter().filter(|i| i.enabled).collect();
        items.sort_by_key(|i| rank(i));
        items
    }

    /// Validates the whole document. Collects every problem rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("production name is empty".to_string());
        }
        if self.items.is_empty() {
            problems.push("production has no items".to_string());
        }

        let mut seen = HashSet::new();
        for item in &self.items {
            if item.item_name().is_err() {
                problems.push(format!("item '{}': invalid name", item.name));
            }
            if !seen.insert(item.name.as_str()) {
                problems.push(format!("item '{}': duplicate name", item.name));
            }
            if item.class_name.trim().is_empty() {
                problems.push(format!("item '{}': empty class_name", item.name));
            }
            if item.effective_pool_size() > 256 {
                problems.push(format!("item '{}': pool size exceeds 256", item.name));
            }
        }

        let enabled: HashMap<&str, &Item> = self
            .items
            .iter()
            .filter(|i| i.enabled)
            .map(|i| (i.name.as_str(), i))
            .collect();

        for item in self.items.iter().filter(|i| i.enabled) {
            for target in item.targets() {
                match enabled.get(target.as_str()) {
                    Some(_) => {}
                    None => problems.push(format!(
                        "item '{}': target '{}' does not resolve to an enabled item",
                        item.name, target
                    )),
                }
            }
            if let Some(handler) = &item.host_settings.bad_message_handler {
                if !enabled.contains_key(handler.as_str()) {
                    problems.push(format!(
                        "item '{}': bad_message_handler '{}' does not resolve to an enabled item",
                        item.name, handler
                    ));
                }
            }
        }

        self.check_cycles(&enabled, &mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig { items: problems })
        }
    }

    /// Static-topology cycle check. A cycle is permitted only when one of
    /// its members is a Process with `allow_cycles` set.
    fn check_cycles(&self, enabled: &HashMap<&str, &Item>, problems: &mut Vec<String>) {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        fn visit<'a>(
            name: &'a str,
            enabled: &HashMap<&'a str, &'a Item>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            match marks.get(name) {
                Some(Mark::Done) => return,
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                    cycles.push(stack[start..].iter().map(ToString::to_string).collect());
                    return;
                }
                None => {}
            }
            marks.insert(name, Mark::InProgress);
            stack.push(name);
            if let Some(item) = enabled.get(name) {
                for target in item.targets() {
                    if enabled.contains_key(target.as_str()) {
                        visit(target.as_str(), enabled, marks, stack, cycles);
                    }
                }
            }
            stack.pop();
            marks.insert(name, Mark::Done);
        }

        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for name in enabled.keys() {
            visit(name, enabled, &mut marks, &mut stack, &mut cycles);
        }

        for cycle in cycles {
            let permitted = cycle.iter().any(|name| {
                enabled.get(name.as_str()).is_some_and(|item| {
                    item.item_type == ItemType::Process && item.host_settings.allow_cycles
                })
            });
            if !permitted {
                problems.push(format!("topology cycle: {}", cycle.join(" -> ")));
            }
        }
    }
}

/// Where production documents come from. The relational configuration store
/// behind the management API satisfies this; the engine only sees typed
/// records.
pub trait ConfigRepository: Send + Sync {
    fn load(&self, project: &str) -> Result<ProductionDocument>;
}

/// Reads `<root>/<project>.json`.
#[derive(Debug, Clone)]
pub struct FileConfigRepository {
    root: PathBuf,
}

impl FileConfigRepository {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ConfigRepository for FileConfigRepository {
    fn load(&self, project: &str) -> Result<ProductionDocument> {
        let path = self.root.join(format!("{project}.json"));
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::validation(format!("read production {}: {e}", path.display()))
        })?;
        let document: ProductionDocument = serde_json::from_str(&raw)?;
        document.validate()?;
        Ok(document)
    }
}

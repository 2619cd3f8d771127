//! HL7 routing process
//!
//! Evaluates an ordered rule list against each message. First match wins
//! unless the rule is marked `continue`; `stop` ends evaluation; `delete`
//! consumes the message. Conditions compile at deploy time so a bad
//! expression is an `InvalidConfig`, never a runtime surprise.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::debug;

use crate::config::Item;
use crate::domain::ItemName;
use crate::envelope::Envelope;
use crate::error::{EngineError, Result};
use crate::hl7::Hl7Message;
use crate::host::{HostBehaviour, ProcessOutcome, RoutedCopy};

use super::expr::Condition;

/// Rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Enqueue a copy to `target`.
    Send,
    /// Apply the named transform, then send to `target`.
    Transform,
    /// Evaluate no further rules.
    Stop,
    /// Drop the message (state delivered, tagged).
    Delete,
}

/// One rule as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    pub name: String,
    pub condition: String,
    pub action: RuleAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    /// Keep evaluating after this rule matches.
    #[serde(default, rename = "continue")]
    pub continue_evaluation: bool,
}

/// Adapter settings of a router item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hl7RouterSettings {
    #[serde(default)]
    pub rules: Vec<RoutingRuleConfig>,
}

struct CompiledRule {
    name: String,
    condition: Condition,
    action: RuleAction,
    target: Option<ItemName>,
    transform: Option<String>,
    continue_evaluation: bool,
}

/// Rule-based routing behaviour.
pub struct Hl7RouterBehaviour {
    rules: RwLock<Vec<CompiledRule>>,
}

impl std::fmt::Debug for Hl7RouterBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hl7RouterBehaviour")
            .field("rules", &self.rules.read().expect("rules lock").len())
            .finish()
    }
}

fn compile(item_name: &str, settings: &Hl7RouterSettings) -> Result<Vec<CompiledRule>> {
    let mut problems = Vec::new();
    let mut compiled = Vec::with_capacity(settings.rules.len());

    for rule in &settings.rules {
        let condition = match Condition::parse(&rule.condition) {
            Ok(condition) => Some(condition),
            Err(e) => {
                problems.push(format!(
                    "item '{item_name}' rule '{}': {e}",
                    rule.name
                ));
                None
            }
        };

        let target = match rule.action {
            RuleAction::Send | RuleAction::Transform => match &rule.target {
                Some(target) => match ItemName::try_new(target.clone()) {
                    Ok(name) => Some(name),
                    Err(e) => {
                        problems.push(format!(
                            "item '{item_name}' rule '{}': bad target: {e}",
                            rule.name
                        ));
                        None
                    }
                },
                None => {
                    problems.push(format!(
                        "item '{item_name}' rule '{}': action requires a target",
                        rule.name
                    ));
                    None
                }
            },
            RuleAction::Stop | RuleAction::Delete => None,
        };

        if rule.action == RuleAction::Transform {
            let transform_name = rule.transform.as_deref().unwrap_or("");
            if super::transform(transform_name).is_none() {
                problems.push(format!(
                    "item '{item_name}' rule '{}': unknown transform '{transform_name}'",
                    rule.name
                ));
            }
        }

        if let Some(condition) = condition {
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                condition,
                action: rule.action,
                target,
                transform: rule.transform.clone(),
                continue_evaluation: rule.continue_evaluation,
            });
        }
    }

    if problems.is_empty() {
        Ok(compiled)
    } else {
        Err(EngineError::InvalidConfig { items: problems })
    }
}

impl Hl7RouterBehaviour {
    pub fn from_item(item: &Item) -> Result<Self> {
        let settings: Hl7RouterSettings = item.adapter()?;
        Ok(Self {
            rules: RwLock::new(compile(&item.name, &settings)?),
        })
    }
}

#[async_trait]
impl HostBehaviour for Hl7RouterBehaviour {
    async fn process(&self, envelope: Envelope) -> Result<ProcessOutcome> {
        let message = Hl7Message::parse(&envelope.payload.raw)?;
        let mut copies = Vec::new();

        let rules = self.rules.read().expect("rules lock");
        for rule in rules.iter() {
            if !rule.condition.matches(&message) {
                continue;
            }
            debug!(rule = %rule.name, message_id = %envelope.message_id, "rule matched");

            match rule.action {
                RuleAction::Send => {
                    let target = rule
                        .target
                        .clone()
                        .ok_or_else(|| EngineError::internal("send rule without target"))?;
                    copies.push(RoutedCopy {
                        target,
                        envelope: envelope.fork().with_route_id(rule.name.clone()),
                    });
                }
                RuleAction::Transform => {
                    let target = rule
                        .target
                        .clone()
                        .ok_or_else(|| EngineError::internal("transform rule without target"))?;
                    let transform_name = rule.transform.as_deref().unwrap_or("identity");
                    let transform = super::transform(transform_name).ok_or_else(|| {
                        EngineError::Transform {
                            name: transform_name.to_string(),
                            detail: "transform disappeared after deploy".to_string(),
                        }
                    })?;
                    let transformed =
                        transform
                            .apply(&envelope)
                            .map_err(|e| EngineError::Transform {
                                name: transform_name.to_string(),
                                detail: e.to_string(),
                            })?;
                    copies.push(RoutedCopy {
                        target,
                        envelope: transformed.with_route_id(rule.name.clone()),
                    });
                }
                RuleAction::Stop => break,
                RuleAction::Delete => {
                    return Ok(ProcessOutcome::Dropped {
                        reason: rule.name.clone(),
                    });
                }
            }

            if !rule.continue_evaluation {
                break;
            }
        }
        drop(rules);

        if copies.is_empty() {
            // No rule claimed it: consumed without downstream.
            Ok(ProcessOutcome::Done(None))
        } else {
            Ok(ProcessOutcome::Route(copies))
        }
    }

    async fn on_reload(&self, item: &Item) -> Result<()> {
        let settings: Hl7RouterSettings = item.adapter()?;
        let compiled = compile(&item.name, &settings)?;
        *self.rules.write().expect("rules lock") = compiled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostSettings;
    use crate::domain::ItemType;
    use crate::envelope::Payload;
    use crate::hosts::HL7_BODY_CLASS;

    const ADT: &[u8] =
        b"MSH|^~\\&|A|B|C|D|20260101000000||ADT^A01|MSG1|P|2.4\rPID|1||9|||19800101|M";
    const ORU: &[u8] =
        b"MSH|^~\\&|A|B|C|D|20260101000000||ORU^R01|MSG2|P|2.4\rOBR|1";

    fn rule(name: &str, condition: &str, action: RuleAction, target: Option<&str>) -> RoutingRuleConfig {
        RoutingRuleConfig {
            name: name.to_string(),
            condition: condition.to_string(),
            action,
            target: target.map(ToString::to_string),
            transform: None,
            continue_evaluation: false,
        }
    }

    fn router(rules: Vec<RoutingRuleConfig>) -> Hl7RouterBehaviour {
        let settings = serde_json::to_value(Hl7RouterSettings { rules }).unwrap();
        let item = Item {
            name: "HL7.Router".to_string(),
            item_type: ItemType::Process,
            class_name: "hl7.router".to_string(),
            enabled: true,
            pool_size: None,
            adapter_settings: settings.as_object().unwrap().clone(),
            host_settings: HostSettings::default(),
        };
        Hl7RouterBehaviour::from_item(&item).unwrap()
    }

    fn envelope(raw: &[u8]) -> Envelope {
        Envelope::new(HL7_BODY_CLASS, Payload::hl7(raw.to_vec()))
    }

    #[test_log::test(tokio::test)]
    async fn first_match_wins() {
        let r = router(vec![
            rule("adt", "{MSH-9.1} = \"ADT\"", RuleAction::Send, Some("Out.A")),
            rule("all", "{MSH-9.1} != \"\"", RuleAction::Send, Some("Out.B")),
        ]);

        match r.process(envelope(ADT)).await.unwrap() {
            ProcessOutcome::Route(copies) => {
                assert_eq!(copies.len(), 1);
                assert_eq!(copies[0].target.as_str(), "Out.A");
                assert_eq!(copies[0].envelope.routing.route_id.as_deref(), Some("adt"));
            }
            other => panic!("expected route, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn continue_evaluates_following_rules() {
        let mut first = rule("adt", "{MSH-9.1} = \"ADT\"", RuleAction::Send, Some("Out.A"));
        first.continue_evaluation = true;
        let r = router(vec![
            first,
            rule("all", "{MSH-10} != \"\"", RuleAction::Send, Some("Out.B")),
        ]);

        match r.process(envelope(ADT)).await.unwrap() {
            ProcessOutcome::Route(copies) => {
                let targets: Vec<&str> = copies.iter().map(|c| c.target.as_str()).collect();
                assert_eq!(targets, vec!["Out.A", "Out.B"]);
            }
            other => panic!("expected route, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn stop_ends_evaluation() {
        let r = router(vec![
            rule("halt", "{MSH-9.1} = \"ADT\"", RuleAction::Stop, None),
            rule("all", "{MSH-10} != \"\"", RuleAction::Send, Some("Out.B")),
        ]);
        assert!(matches!(
            r.process(envelope(ADT)).await.unwrap(),
            ProcessOutcome::Done(None)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn delete_drops_the_message() {
        let r = router(vec![rule(
            "discard",
            "{MSH-9.1} = \"ORU\"",
            RuleAction::Delete,
            None,
        )]);
        match r.process(envelope(ORU)).await.unwrap() {
            ProcessOutcome::Dropped { reason } => assert_eq!(reason, "discard"),
            other => panic!("expected drop, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn unmatched_message_is_consumed() {
        let r = router(vec![rule(
            "adt",
            "{MSH-9.1} = \"ADT\"",
            RuleAction::Send,
            Some("Out.A"),
        )]);
        assert!(matches!(
            r.process(envelope(ORU)).await.unwrap(),
            ProcessOutcome::Done(None)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn transform_rule_applies_named_transform() {
        let r = router(vec![RoutingRuleConfig {
            name: "xf".to_string(),
            condition: "{MSH-9.1} = \"ADT\"".to_string(),
            action: RuleAction::Transform,
            target: Some("Out.A".to_string()),
            transform: Some("identity".to_string()),
            continue_evaluation: false,
        }]);

        let env = envelope(ADT);
        match r.process(env.clone()).await.unwrap() {
            ProcessOutcome::Route(copies) => {
                assert_eq!(copies[0].envelope.causation_id, Some(env.message_id));
            }
            other => panic!("expected route, got {other:?}"),
        }
    }

    #[test_log::test]
    fn bad_condition_fails_at_deploy() {
        let settings = serde_json::to_value(Hl7RouterSettings {
            rules: vec![rule("broken", "{MSH-9.1} = ", RuleAction::Send, Some("X"))],
        })
        .unwrap();
        let item = Item {
            name: "R".to_string(),
            item_type: ItemType::Process,
            class_name: "hl7.router".to_string(),
            enabled: true,
            pool_size: None,
            adapter_settings: settings.as_object().unwrap().clone(),
            host_settings: HostSettings::default(),
        };
        assert!(matches!(
            Hl7RouterBehaviour::from_item(&item),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test_log::test]
    fn send_rule_requires_target() {
        let settings = serde_json::to_value(Hl7RouterSettings {
            rules: vec![rule("no-target", "{MSH-9.1} = \"ADT\"", RuleAction::Send, None)],
        })
        .unwrap();
        let item = Item {
            name: "R".to_string(),
            item_type: ItemType::Process,
            class_name: "hl7.router".to_string(),
            enabled: true,
            pool_size: None,
            adapter_settings: settings.as_object().unwrap().clone(),
            host_settings: HostSettings::default(),
        };
        assert!(Hl7RouterBehaviour::from_item(&item).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn non_hl7_payload_is_a_validation_error() {
        let r = router(vec![rule(
            "adt",
            "{MSH-9.1} = \"ADT\"",
            RuleAction::Send,
            Some("Out.A"),
        )]);
        let bad = Envelope::new(HL7_BODY_CLASS, Payload::hl7(b"not hl7 at all".to_vec()));
        assert!(matches!(
            r.process(bad).await,
            Err(EngineError::Validation { .. })
        ));
    }
}

//! HL7 TCP operation (outbound)
//!
//! Maintains a client connection to the downstream system, frames each
//! envelope via MLLP, awaits the acknowledgement and interprets its code
//! through the `reply_code_actions` mini-language. Transport failures drop
//! the connection and reconnect with exponential backoff bounded by
//! `reconnect_interval_ms`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::config::Item;
use crate::domain::MaxMessageSize;
use crate::envelope::{Envelope, Payload};
use crate::error::{EngineError, Result};
use crate::hl7::{AckCode, Hl7Message};
use crate::host::{HostBehaviour, ProcessOutcome};
use crate::mllp::{MllpDecoder, encode_frame};

use super::HL7_ACK_BODY_CLASS;

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_ack_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_interval_ms() -> u64 {
    30_000
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

/// Adapter settings of an outbound HL7 item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7OperationSettings {
    pub ip_address: String,
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Upper bound on reconnect backoff.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Persist raw outbound/ACK bytes on the trace row.
    #[serde(default)]
    pub archive_io: bool,
}

/// Action taken on a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    /// Commit.
    Success,
    /// Fail; the message goes to the error route.
    Fail,
    /// Retry after `retry_interval` up to `max_retries`.
    Retry,
    /// Commit, but flag a warning.
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyPattern {
    Exact(AckCode),
    AnyError,
    AnyReject,
    Any,
}

impl ReplyPattern {
    fn matches(self, code: AckCode) -> bool {
        match self {
            Self::Exact(expected) => expected == code,
            Self::AnyError => code == AckCode::Ae,
            Self::AnyReject => code == AckCode::Ar,
            Self::Any => true,
        }
    }
}

/// Parsed `reply_code_actions` expression: `pattern=action` pairs,
/// comma-separated, first match wins.
#[derive(Debug, Clone)]
pub struct ReplyCodeActions {
    pairs: Vec<(ReplyPattern, ReplyAction)>,
}

impl Default for ReplyCodeActions {
    /// Accept positives, retry application errors, fail rejects.
    fn default() -> Self {
        Self {
            pairs: vec![
                (ReplyPattern::Exact(AckCode::Aa), ReplyAction::Success),
                (ReplyPattern::Exact(AckCode::Ca), ReplyAction::Success),
                (ReplyPattern::AnyError, ReplyAction::Retry),
                (ReplyPattern::AnyReject, ReplyAction::Fail),
                (ReplyPattern::Any, ReplyAction::Success),
            ],
        }
    }
}

impl ReplyCodeActions {
    /// Parses e.g. `":AA=S,:?E=R,:?R=F,:*=W"`.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for entry in expression.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (pattern_str, action_str) = entry.split_once('=').ok_or_else(|| {
                EngineError::validation(format!("reply_code_actions entry '{entry}': missing '='"))
            })?;
            let pattern_str = pattern_str.trim().strip_prefix(':').ok_or_else(|| {
                EngineError::validation(format!(
                    "reply_code_actions entry '{entry}': pattern must start with ':'"
                ))
            })?;

            let pattern = match pattern_str {
                "AA" => ReplyPattern::Exact(AckCode::Aa),
                "CA" => ReplyPattern::Exact(AckCode::Ca),
                "AE" => ReplyPattern::Exact(AckCode::Ae),
                "AR" => ReplyPattern::Exact(AckCode::Ar),
                "?E" => ReplyPattern::AnyError,
                "?R" => ReplyPattern::AnyReject,
                "*" => ReplyPattern::Any,
                other => {
                    return Err(EngineError::validation(format!(
                        "reply_code_actions: unknown pattern ':{other}'"
                    )));
                }
            };
            let action = match action_str.trim() {
                "S" => ReplyAction::Success,
                "F" => ReplyAction::Fail,
                "R" => ReplyAction::Retry,
                "W" => ReplyAction::Warn,
                other => {
                    return Err(EngineError::validation(format!(
                        "reply_code_actions: unknown action '{other}'"
                    )));
                }
            };
            pairs.push((pattern, action));
        }
        if pairs.is_empty() {
            return Err(EngineError::validation("reply_code_actions is empty"));
        }
        Ok(Self { pairs })
    }

    /// First matching pattern wins; with no match at all, positives commit
    /// and everything else fails.
    #[must_use]
    pub fn evaluate(&self, code: AckCode) -> ReplyAction {
        for (pattern, action) in &self.pairs {
            if pattern.matches(code) {
                return *action;
            }
        }
        if code.is_positive() {
            ReplyAction::Success
        } else {
            ReplyAction::Fail
        }
    }
}

struct Connection {
    writer: OwnedWriteHalf,
    reader: MllpDecoder<OwnedReadHalf>,
}

/// Outbound HL7 behaviour.
pub struct Hl7OperationBehaviour {
    settings: RwLock<Hl7OperationSettings>,
    actions: RwLock<ReplyCodeActions>,
    retry_limit: RwLock<(u32, u64)>, // (max_retries, retry_interval_ms)
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Hl7OperationBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.settings.read().expect("settings lock");
        f.debug_struct("Hl7OperationBehaviour")
            .field("remote", &format!("{}:{}", settings.ip_address, settings.port))
            .finish_non_exhaustive()
    }
}

impl Hl7OperationBehaviour {
    pub fn from_item(item: &Item) -> Result<Self> {
        let settings: Hl7OperationSettings = item.adapter()?;
        let actions = match &item.host_settings.reply_code_actions {
            Some(expression) => ReplyCodeActions::parse(expression)?,
            None => ReplyCodeActions::default(),
        };
        Ok(Self {
            settings: RwLock::new(settings),
            actions: RwLock::new(actions),
            retry_limit: RwLock::new((
                item.host_settings.max_retries.as_u32(),
                item.host_settings.retry_interval_ms.as_u64(),
            )),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    fn settings_snapshot(&self) -> Hl7OperationSettings {
        self.settings.read().expect("settings lock").clone()
    }

    #[must_use]
    pub fn remote_endpoint(&self) -> (String, u16) {
        let settings = self.settings.read().expect("settings lock");
        (settings.ip_address.clone(), settings.port)
    }

    async fn connect(settings: &Hl7OperationSettings) -> Result<Connection> {
        let addr = format!("{}:{}", settings.ip_address, settings.port);
        let stream = tokio::time::timeout(
            Duration::from_millis(settings.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| EngineError::ConnectFailed {
            addr: addr.clone(),
            detail: "connect timeout".to_string(),
        })?
        .map_err(|e| EngineError::ConnectFailed {
            addr: addr.clone(),
            detail: e.to_string(),
        })?;

        info!(remote = %addr, "outbound connection established");
        let (read_half, write_half) = stream.into_split();
        let max = MaxMessageSize::try_new(settings.max_message_size)
            .unwrap_or_else(|_| MaxMessageSize::default());
        Ok(Connection {
            writer: write_half,
            reader: MllpDecoder::new(
                read_half,
                max,
                Duration::from_millis(settings.ack_timeout_ms),
            ),
        })
    }

    /// One framed write plus ACK read on the (possibly reused) connection.
    async fn deliver_once(&self, envelope: &Envelope) -> Result<(Vec<u8>, AckCode)> {
        let settings = self.settings_snapshot();
        let mut guard = self.connection.lock().await;

        if guard.is_none() {
            *guard = Some(Self::connect(&settings).await?);
        }
        let connection = guard.as_mut().expect("connection just ensured");

        let frame = encode_frame(&envelope.payload.raw);
        let write = tokio::time::timeout(
            Duration::from_millis(settings.write_timeout_ms),
            connection.writer.write_all(&frame),
        )
        .await;

        let write_result = match write {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_elapsed) => Err(EngineError::WriteTimeout {
                timeout_ms: settings.write_timeout_ms,
            }),
        };
        if let Err(e) = write_result {
            *guard = None;
            return Err(e);
        }

        match connection.reader.read_message().await {
            Ok(Some(ack_raw)) => {
                let ack = Hl7Message::parse(&ack_raw)?;
                let code = ack.ack_code().ok_or_else(|| EngineError::RequestErrored {
                    detail: "acknowledgement carries no MSA code".to_string(),
                })?;
                Ok((ack_raw.to_vec(), code))
            }
            Ok(None) => {
                *guard = None;
                Err(EngineError::Truncated)
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    fn ack_envelope(envelope: &Envelope, ack_raw: Vec<u8>, code: AckCode, warned: bool) -> Envelope {
        let mut ack = envelope.child(HL7_ACK_BODY_CLASS, Payload::hl7(ack_raw));
        ack.correlation_id = envelope.correlation_id;
        ack = ack.with_message_type(code.as_str());
        if warned {
            ack = ack.with_tag("warned");
        }
        ack
    }
}

#[async_trait]
impl HostBehaviour for Hl7OperationBehaviour {
    async fn process(&self, envelope: Envelope) -> Result<ProcessOutcome> {
        let (max_retries, retry_interval_ms) = *self.retry_limit.read().expect("retry lock");
        let reconnect_cap = self.settings_snapshot().reconnect_interval_ms;
        let mut current = envelope.with_retry_policy(max_retries, retry_interval_ms);

        loop {
            let envelope = &current;
            let retry_reason: EngineError = match self.deliver_once(envelope).await {
                Ok((ack_raw, code)) => {
                    let action = self.actions.read().expect("actions lock").evaluate(code);
                    match action {
                        ReplyAction::Success => {
                            return Ok(ProcessOutcome::Done(Some(Self::ack_envelope(
                                envelope, ack_raw, code, false,
                            ))));
                        }
                        ReplyAction::Warn => {
                            warn!(
                                message_id = %envelope.message_id,
                                code = code.as_str(),
                                "remote warned; committing"
                            );
                            return Ok(ProcessOutcome::Done(Some(Self::ack_envelope(
                                envelope, ack_raw, code, true,
                            ))));
                        }
                        ReplyAction::Fail => {
                            return Err(match code {
                                AckCode::Ar => EngineError::RequestRejected {
                                    detail: format!("remote answered {}", code.as_str()),
                                },
                                _ => EngineError::RequestErrored {
                                    detail: format!("remote answered {}", code.as_str()),
                                },
                            });
                        }
                        ReplyAction::Retry => match code {
                            AckCode::Ar => EngineError::RequestRejected {
                                detail: format!("remote answered {}", code.as_str()),
                            },
                            _ => EngineError::RequestErrored {
                                detail: format!("remote answered {}", code.as_str()),
                            },
                        },
                    }
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if current.retries_exhausted() {
                debug!(
                    message_id = %current.message_id,
                    attempts = current.retry_count,
                    "retries exhausted"
                );
                return Err(retry_reason);
            }
            current = current.next_retry();

            // Exponential backoff bounded by the reconnect interval.
            let backoff = retry_interval_ms
                .saturating_mul(1_u64 << (current.retry_count - 1).min(16))
                .min(reconnect_cap.max(retry_interval_ms));
            warn!(
                message_id = %current.message_id,
                attempt = current.retry_count,
                backoff_ms = backoff,
                error = %retry_reason,
                "delivery attempt failed; retrying"
            );
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    async fn on_reload(&self, item: &Item) -> Result<()> {
        let settings: Hl7OperationSettings = item.adapter()?;
        let actions = match &item.host_settings.reply_code_actions {
            Some(expression) => ReplyCodeActions::parse(expression)?,
            None => ReplyCodeActions::default(),
        };
        *self.settings.write().expect("settings lock") = settings;
        *self.actions.write().expect("actions lock") = actions;
        *self.retry_limit.write().expect("retry lock") = (
            item.host_settings.max_retries.as_u32(),
            item.host_settings.retry_interval_ms.as_u64(),
        );
        // Drop the connection so the next delivery reconnects with the new
        // endpoint.
        *self.connection.lock().await = None;
        Ok(())
    }

    async fn on_stop(&self, _ctx: &crate::host::HostContext) -> Result<()> {
        *self.connection.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn parse_and_evaluate_first_match() {
        let actions = ReplyCodeActions::parse(":AA=S,:?E=R,:?R=F,:*=W").unwrap();
        assert_eq!(actions.evaluate(AckCode::Aa), ReplyAction::Success);
        assert_eq!(actions.evaluate(AckCode::Ae), ReplyAction::Retry);
        assert_eq!(actions.evaluate(AckCode::Ar), ReplyAction::Fail);
        // CA falls through to the wildcard.
        assert_eq!(actions.evaluate(AckCode::Ca), ReplyAction::Warn);
    }

    #[test_log::test]
    fn earlier_pattern_shadows_wildcard() {
        let actions = ReplyCodeActions::parse(":?R=F,:*=S").unwrap();
        assert_eq!(actions.evaluate(AckCode::Ar), ReplyAction::Fail);
        assert_eq!(actions.evaluate(AckCode::Ae), ReplyAction::Success);
        assert_eq!(actions.evaluate(AckCode::Aa), ReplyAction::Success);
    }

    #[test_log::test]
    fn no_match_defaults_by_polarity() {
        let actions = ReplyCodeActions::parse(":AE=R").unwrap();
        assert_eq!(actions.evaluate(AckCode::Aa), ReplyAction::Success);
        assert_eq!(actions.evaluate(AckCode::Ar), ReplyAction::Fail);
    }

    #[test_log::test]
    fn parse_rejects_malformed_expressions() {
        assert!(ReplyCodeActions::parse("").is_err());
        assert!(ReplyCodeActions::parse("AA=S").is_err());
        assert!(ReplyCodeActions::parse(":AA").is_err());
        assert!(ReplyCodeActions::parse(":XX=S").is_err());
        assert!(ReplyCodeActions::parse(":AA=Z").is_err());
    }

    #[test_log::test]
    fn default_actions_retry_errors_fail_rejects() {
        let actions = ReplyCodeActions::default();
        assert_eq!(actions.evaluate(AckCode::Aa), ReplyAction::Success);
        assert_eq!(actions.evaluate(AckCode::Ca), ReplyAction::Success);
        assert_eq!(actions.evaluate(AckCode::Ae), ReplyAction::Retry);
        assert_eq!(actions.evaluate(AckCode::Ar), ReplyAction::Fail);
    }

    #[test_log::test]
    fn settings_defaults() {
        let settings: Hl7OperationSettings =
            serde_json::from_str(r#"{"ip_address": "10.0.0.5", "port": 5000}"#).unwrap();
        assert_eq!(settings.connect_timeout_ms, 10_000);
        assert_eq!(settings.ack_timeout_ms, 15_000);
        assert!(!settings.archive_io);
    }
}

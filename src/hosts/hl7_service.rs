//! HL7 TCP service (inbound)
//!
//! Binds a listener and runs one MLLP reader per connection. Each decoded
//! payload is stamped with a fresh session id, made durable in the WAL,
//! acknowledged per the configured ACK mode, and dispatched to the
//! configured targets through the broker. The inbound trace row is the one
//! row in a session with no source item.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Item;
use crate::domain::{AckMode, Direction, ItemName, ItemType, MaxMessageSize, MessageState};
use crate::envelope::{Envelope, Payload};
use crate::error::{EngineError, Result};
use crate::hl7::{AckCode, Hl7Message};
use crate::host::{HostBehaviour, HostContext, ProcessOutcome};
use crate::mllp::{MllpDecoder, encode_frame};

use super::{BAD_MESSAGE_BODY_CLASS, HL7_BODY_CLASS};

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

/// Adapter settings of an inbound HL7 item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hl7ServiceSettings {
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Schema category tag stamped on payloads, e.g. `2.4`.
    #[serde(default)]
    pub message_schema_category: Option<String>,
}

/// Inbound HL7 behaviour.
pub struct Hl7ServiceBehaviour {
    settings: RwLock<Hl7ServiceSettings>,
    /// Actual bound address, for health and for tests binding port 0.
    local_addr: RwLock<Option<SocketAddr>>,
}

impl std::fmt::Debug for Hl7ServiceBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hl7ServiceBehaviour")
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl Hl7ServiceBehaviour {
    pub fn from_item(item: &Item) -> Result<Self> {
        let settings: Hl7ServiceSettings = item.adapter()?;
        Ok(Self {
            settings: RwLock::new(settings),
            local_addr: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().expect("addr lock")
    }

    fn settings_snapshot(&self) -> Hl7ServiceSettings {
        self.settings.read().expect("settings lock").clone()
    }
}

#[async_trait]
impl HostBehaviour for Hl7ServiceBehaviour {
    /// Services have no queue-driven work of their own; anything enqueued at
    /// them (a resend, say) is forwarded to their targets.
    async fn process(&self, envelope: Envelope) -> Result<ProcessOutcome> {
        Ok(ProcessOutcome::Forward(envelope))
    }

    async fn on_reload(&self, item: &Item) -> Result<()> {
        let settings: Hl7ServiceSettings = item.adapter()?;
        *self.settings.write().expect("settings lock") = settings;
        Ok(())
    }

    async fn run_adapter(&self, ctx: HostContext) -> Result<()> {
        let settings = self.settings_snapshot();
        let bind = format!("{}:{}", settings.bind_address, settings.port);
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            EngineError::ConnectFailed {
                addr: bind.clone(),
                detail: format!("bind failed: {e}"),
            }
        })?;
        let local = listener.local_addr()?;
        *self.local_addr.write().expect("addr lock") = Some(local);
        info!(host = %ctx.name, addr = %local, "hl7 listener ready");

        let limiter = Arc::new(Semaphore::new(settings.max_connections));
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = ctx.cancel.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(host = %ctx.name, error = %e, "accept failed");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                warn!(host = %ctx.name, %peer, "connection limit reached; refusing");
                drop(stream);
                continue;
            };

            let ctx = ctx.clone();
            let settings = self.settings_snapshot();
            tokio::spawn(async move {
                debug!(host = %ctx.name, %peer, "connection open");
                if let Err(e) = handle_connection(stream, peer, &ctx, &settings).await {
                    debug!(host = %ctx.name, %peer, error = %e, "connection closed");
                }
                drop(permit);
            });
        }

        info!(host = %ctx.name, "hl7 listener stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &HostContext,
    settings: &Hl7ServiceSettings,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let max = MaxMessageSize::try_new(settings.max_message_size)
        .unwrap_or_else(|_| MaxMessageSize::default());
    let mut decoder = MllpDecoder::new(
        read_half,
        max,
        Duration::from_millis(settings.read_timeout_ms),
    );

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let payload = tokio::select! {
            payload = decoder.read_message() => payload,
            () = ctx.cancel.cancelled() => return Ok(()),
        };

        match payload {
            Ok(Some(payload)) => {
                handle_payload(payload, &mut write_half, peer, ctx, settings).await?;
            }
            Ok(None) => return Ok(()),
            // Idle connections simply wait for the next frame.
            Err(EngineError::ReadTimeout { .. }) => continue,
            Err(err @ (EngineError::Framing { .. } | EngineError::Truncated)) => {
                // NACK if enough of an MSH survived to address one; reset
                // the connection otherwise.
                let partial = decoder.partial_frame().cloned();
                match nack_for_partial(partial.as_deref(), AckCode::Ae, &err.to_string()) {
                    Some(nack) => {
                        write_ack(&mut write_half, &nack, settings.write_timeout_ms).await?;
                        if matches!(err, EngineError::Truncated) {
                            return Err(err);
                        }
                    }
                    None => return Err(err),
                }
            }
            Err(err @ EngineError::MessageTooLarge { .. }) => {
                warn!(host = %ctx.name, %peer, error = %err, "oversized frame rejected");
                let partial = decoder.partial_frame().cloned();
                if let Some(nack) =
                    nack_for_partial(partial.as_deref(), AckCode::Ar, &err.to_string())
                {
                    write_ack(&mut write_half, &nack, settings.write_timeout_ms).await?;
                }
                // The decoder resynchronises at the next frame.
            }
            Err(err) => return Err(err),
        }
    }
}

/// Builds a NACK when the aborted frame still carries a parseable MSH.
fn nack_for_partial(partial: Option<&[u8]>, code: AckCode, text: &str) -> Option<Vec<u8>> {
    let partial = partial?;
    let message = Hl7Message::parse(partial).ok()?;
    Some(message.build_ack(code, Some(text)))
}

async fn write_ack(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    ack_body: &[u8],
    write_timeout_ms: u64,
) -> Result<()> {
    let frame = encode_frame(ack_body);
    match tokio::time::timeout(
        Duration::from_millis(write_timeout_ms),
        writer.write_all(&frame),
    )
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EngineError::Io(e)),
        Err(_elapsed) => Err(EngineError::WriteTimeout {
            timeout_ms: write_timeout_ms,
        }),
    }
}

async fn handle_payload(
    payload: Bytes,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    peer: SocketAddr,
    ctx: &HostContext,
    settings: &Hl7ServiceSettings,
) -> Result<()> {
    let ack_mode = ctx.item.host_settings.ack_mode;
    let pattern = ctx.item.host_settings.messaging_pattern;
    let message_timeout = ctx.item.host_settings.message_timeout_ms.as_duration();

    // Undecodable content goes to the bad-message route, never downstream.
    let parsed = match Hl7Message::parse(&payload) {
        Ok(parsed) => parsed,
        Err(parse_err) => {
            warn!(host = %ctx.name, %peer, error = %parse_err, "bad message received");
            route_bad_message(payload, ctx).await;
            return Ok(());
        }
    };

    let session = crate::domain::SessionId::ingress();
    let mut body = Payload::hl7(payload.to_vec());
    if let Some(schema) = parsed.schema_name() {
        body = body.with_schema_name(schema);
    }
    if let Some(category) = &settings.message_schema_category {
        body.properties.insert(
            "schema_category".to_string(),
            serde_json::Value::String(category.clone()),
        );
    }

    let mut envelope = Envelope::new(HL7_BODY_CLASS, body).with_session(session);
    if let Some(message_type) = parsed.message_type() {
        envelope = envelope.with_message_type(message_type);
    }

    // Durability before acknowledgement: the CA/AA contract is "persisted".
    let mut visit = ctx
        .tracer
        .start_visit(&envelope, &ctx.name, ItemType::Service, Direction::Inbound);
    visit.set_remote(peer.ip().to_string(), peer.port());

    if let Err(e) = ctx.wal.append(envelope.clone()).await {
        warn!(host = %ctx.name, error = %e, "wal append failed; NACKing");
        visit.fail(&e);
        let nack = parsed.build_ack(AckCode::Ae, Some("durability failure"));
        write_ack(writer, &nack, settings.write_timeout_ms).await?;
        // Ingress connection closes on durability failure.
        return Err(e);
    }

    if ack_mode == AckMode::Immediate {
        let ack = parsed.build_ack(AckCode::Ca, None);
        visit.set_ack(ack.clone(), AckCode::Ca.as_str());
        if let Err(e) = write_ack(writer, &ack, settings.write_timeout_ms).await {
            visit.fail(&e);
            return Err(e);
        }
    }

    // Dispatch to every configured target; sync patterns propagate the
    // downstream status into the ACK.
    let targets: Vec<ItemName> = ctx
        .item
        .host_settings
        .target_config_names
        .iter()
        .filter_map(|t| ItemName::try_new(t.clone()).ok())
        .collect();

    let dispatch: Result<()> = async {
        for target in &targets {
            let copy = envelope.fork();
            if pattern.is_sync() {
                ctx.broker
                    .send_request_sync(&ctx.name, target, copy, message_timeout)
                    .await?;
            } else {
                ctx.broker
                    .send_request_async(&ctx.name, target, copy)
                    .await?;
            }
        }
        Ok(())
    }
    .await;

    match dispatch {
        Ok(()) => {
            if let Err(e) = ctx
                .wal
                .append(envelope.clone().with_state(MessageState::Delivered))
                .await
            {
                warn!(host = %ctx.name, error = %e, "wal append failed after dispatch");
            }
            if matches!(ack_mode, AckMode::Application) {
                let ack = parsed.build_ack(AckCode::Aa, None);
                visit.set_ack(ack.clone(), AckCode::Aa.as_str());
                if let Err(e) = write_ack(writer, &ack, settings.write_timeout_ms).await {
                    visit.fail(&e);
                    return Err(e);
                }
            }
            visit.complete();
            Ok(())
        }
        Err(e) => {
            if let Err(wal_err) = ctx
                .wal
                .append(envelope.clone().with_state(MessageState::Failed))
                .await
            {
                warn!(host = %ctx.name, error = %wal_err, "wal append failed after dispatch failure");
            }
            if matches!(ack_mode, AckMode::Application) {
                let code = if e.is_application_error() {
                    AckCode::Ae
                } else {
                    AckCode::Ar
                };
                let nack = parsed.build_ack(code, Some(&e.to_string()));
                visit.set_ack(nack.clone(), code.as_str());
                if let Err(write_err) = write_ack(writer, &nack, settings.write_timeout_ms).await {
                    visit.fail(&write_err);
                    return Err(write_err);
                }
            }
            visit.fail(&e);
            // The connection survives an application-level failure.
            Ok(())
        }
    }
}

/// Messages that fail decoding are wrapped and offered to the configured
/// bad-message handler; with no handler they are dead-lettered.
async fn route_bad_message(payload: Bytes, ctx: &HostContext) {
    let envelope = Envelope::new(
        BAD_MESSAGE_BODY_CLASS,
        Payload {
            raw: payload.to_vec(),
            content_type: "application/octet-stream".to_string(),
            encoding: "binary".to_string(),
            schema_name: None,
            schema_namespace: None,
            properties: std::collections::BTreeMap::new(),
        },
    )
    .with_session(crate::domain::SessionId::ingress());

    match &ctx.item.host_settings.bad_message_handler {
        Some(handler) => {
            let Ok(handler) = ItemName::try_new(handler.clone()) else {
                ctx.broker.dead_letter(&envelope, "bad message; invalid handler name").await;
                return;
            };
            if let Err(e) = ctx
                .broker
                .send_request_async(&ctx.name, &handler, envelope.clone())
                .await
            {
                warn!(host = %ctx.name, error = %e, "bad message handler unreachable");
            }
        }
        None => {
            ctx.broker.dead_letter(&envelope, "undecodable message").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn settings_defaults() {
        let settings: Hl7ServiceSettings = serde_json::from_str(r#"{"port": 2575}"#).unwrap();
        assert_eq!(settings.bind_address, "0.0.0.0");
        assert_eq!(settings.max_connections, 64);
        assert_eq!(settings.read_timeout_ms, 30_000);
        assert_eq!(settings.max_message_size, 10 * 1024 * 1024);
    }

    #[test_log::test]
    fn nack_requires_a_parseable_msh() {
        assert!(nack_for_partial(None, AckCode::Ae, "x").is_none());
        assert!(nack_for_partial(Some(b"garbage"), AckCode::Ae, "x").is_none());

        let partial = b"MSH|^~\\&|A|B|C|D|1||ADT^A01|CTRL|P|2.4\rPID|trunc";
        let nack = nack_for_partial(Some(partial), AckCode::Ae, "truncated").unwrap();
        let parsed = Hl7Message::parse(&nack).unwrap();
        assert_eq!(parsed.ack_code(), Some(AckCode::Ae));
        assert_eq!(parsed.acked_control_id(), Some("CTRL"));
    }
}

//! Error types for the Hermes engine
//!
//! One taxonomy covers the whole runtime: transport errors stay local to a
//! connection, policy errors stop a single message, durability errors bubble
//! up to the ingress, and response errors surface through the caller's
//! response slot.

use thiserror::Error;

use crate::domain::{HostState, MessageId};

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error enum for the Hermes engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // -- Transport --------------------------------------------------------
    #[error("framing error: {detail}")]
    Framing { detail: String },

    #[error("stream closed mid-frame")]
    Truncated,

    #[error("read timed out after {timeout_ms}ms")]
    ReadTimeout { timeout_ms: u64 },

    #[error("connect to {addr} failed: {detail}")]
    ConnectFailed { addr: String, detail: String },

    #[error("write timed out after {timeout_ms}ms")]
    WriteTimeout { timeout_ms: u64 },

    // -- Policy -----------------------------------------------------------
    #[error("message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("queue full on item: {item}")]
    QueueFull { item: String },

    #[error("message {message_id} expired")]
    Expired { message_id: MessageId },

    #[error("routing loop detected for message {message_id} after {hops} hops")]
    LoopDetected { message_id: MessageId, hops: u32 },

    #[error("unknown target item: {target}")]
    UnknownTarget { target: String },

    #[error("invalid configuration: {}", items.join("; "))]
    InvalidConfig { items: Vec<String> },

    // -- Durability -------------------------------------------------------
    #[error("write-ahead log failure: {detail}")]
    Durability { detail: String },

    #[error("message store unavailable: {detail}")]
    StoreUnavailable { detail: String },

    // -- Processing -------------------------------------------------------
    #[error("validation error: {detail}")]
    Validation { detail: String },

    #[error("transform '{name}' failed: {detail}")]
    Transform { name: String, detail: String },

    #[error("rule '{rule}' failed to evaluate: {detail}")]
    RuleEvaluation { rule: String, detail: String },

    // -- Response ---------------------------------------------------------
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("request rejected by remote: {detail}")]
    RequestRejected { detail: String },

    #[error("remote signalled an application error: {detail}")]
    RequestErrored { detail: String },

    // -- Lifecycle / infrastructure ---------------------------------------
    #[error("invalid host state transition: {from:?} -> {to:?}")]
    StateTransition { from: HostState, to: HostState },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn framing(detail: impl Into<String>) -> Self {
        Self::Framing {
            detail: detail.into(),
        }
    }

    pub fn durability(detail: impl Into<String>) -> Self {
        Self::Durability {
            detail: detail.into(),
        }
    }

    pub fn store_unavailable(detail: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
        }
    }

    pub fn unknown_target(target: impl Into<String>) -> Self {
        Self::UnknownTarget {
            target: target.into(),
        }
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::Cancelled(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// True when the error should be reported to an MLLP sender as `AE`
    /// rather than `AR`.
    ///
    /// `AR` is reserved for outright rejection of oversized content;
    /// everything else the application may retry.
    #[must_use]
    pub fn is_application_error(&self) -> bool {
        !matches!(self, Self::MessageTooLarge { .. })
    }

    /// True for errors that a delivery retry could plausibly clear.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::ReadTimeout { .. }
                | Self::WriteTimeout { .. }
                | Self::Timeout { .. }
                | Self::Truncated
                | Self::Io(_)
        )
    }
}

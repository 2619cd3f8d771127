//! Domain types for the Hermes engine
//!
//! Strongly-typed domain values shared across the runtime, preventing
//! primitive obsession at the seams between the codec, queues, hosts, broker
//! and stores.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one message instance.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier shared between a request and its response.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of the ingress that initiated a pipeline run.
///
/// Generated exactly once, at the first inbound host, and propagated
/// unchanged downstream.
#[nutype(
    validate(predicate = |s| s.starts_with("SES-")),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct SessionId(String);

impl SessionId {
    /// Session ID minted at an inbound host.
    #[must_use]
    pub fn ingress() -> Self {
        Self::try_new(format!("SES-{}", Uuid::new_v4())).expect("SES- prefix is always valid")
    }

    /// Session ID minted for an operator test send.
    #[must_use]
    pub fn test_send() -> Self {
        Self::try_new(format!("SES-test-{}", Uuid::new_v4())).expect("SES- prefix is always valid")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Name of an item (host) within a production. Unique per production.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct ItemName(String);

impl ItemName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Identifier of a deployed production (project).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct ProjectId(String);

impl ProjectId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Bounded queue capacity.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum accepted MLLP payload size in bytes.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 104_857_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_485_760
)]
pub struct MaxMessageSize(usize);

impl MaxMessageSize {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Re-enqueue ceiling before a message is dead-lettered with `LoopDetected`.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 16
)]
pub struct HopLimit(u32);

impl HopLimit {
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Maximum delivery retry attempts.
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Maximum automatic host restarts before the supervisor gives up.
#[nutype(
    validate(less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct MaxRestarts(u32);

impl MaxRestarts {
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Millisecond duration used for timeouts, delays and intervals.
#[nutype(
    validate(less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct Millis(u64);

impl Millis {
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Message priority, used by priority queues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Delivery guarantee requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// Message lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Received,
    Enqueued,
    Processing,
    AwaitingReply,
    Delivered,
    Failed,
    Expired,
    DeadLettered,
}

impl MessageState {
    /// Terminal states are never replayed from the WAL.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::Expired | Self::DeadLettered
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Enqueued => "enqueued",
            Self::Processing => "processing",
            Self::AwaitingReply => "awaiting_reply",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "enqueued" => Ok(Self::Enqueued),
            "processing" => Ok(Self::Processing),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown message state: {other}")),
        }
    }
}

/// Kind of item within a production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// Inbound: accepts traffic from external systems.
    Service,
    /// Routing / transformation between hosts.
    Process,
    /// Outbound: delivers to external systems.
    Operation,
}

impl ItemType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Process => "process",
            Self::Operation => "operation",
        }
    }
}

impl std::str::FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "service" => Ok(Self::Service),
            "process" => Ok(Self::Process),
            "operation" => Ok(Self::Operation),
            other => Err(format!("unknown item type: {other}")),
        }
    }
}

/// Direction of a host visit, as recorded on trace rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Internal => "internal",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// When an inbound HL7 host acknowledges a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckMode {
    /// `CA` as soon as the frame is persisted to the WAL.
    Immediate,
    /// ACK withheld until downstream processing reports a status.
    #[default]
    Application,
    /// No ACK; senders must tolerate silence.
    Never,
}

/// Queue discipline for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Fifo,
    Priority,
    Lifo,
    Unordered,
}

/// What happens when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Back-pressure the producer.
    #[default]
    Block,
    /// Remove the head to make room; the displaced message is dead-lettered.
    DropOldest,
    /// Refuse the new message silently (logged).
    DropNewest,
    /// Signal `QueueFull` to the producer.
    Reject,
}

/// How a host's workers are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Lightweight tasks on the shared scheduler. Default; I/O bound work.
    #[default]
    Cooperative,
    /// Dedicated OS threads; for blocking client libraries.
    Threaded,
    /// OS processes; for CPU-bound transforms needing true parallelism.
    MultiProcess,
    /// One worker in the caller's context; debugging.
    Single,
}

/// Request/response discipline between a producer and a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingPattern {
    /// Producer is acknowledged after WAL commit; processing is concurrent.
    #[default]
    AsyncReliable,
    /// Producer blocks on a response slot; FIFO ordering enforced.
    SyncReliable,
    /// Async without ordering; best throughput.
    ConcurrentAsync,
    /// Parallel workers, each blocking on its own request.
    ConcurrentSync,
}

impl MessagingPattern {
    /// True when the producer awaits a correlated response.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::SyncReliable | Self::ConcurrentSync)
    }
}

/// Supervisor policy applied when a host enters the `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    #[default]
    OnFailure,
    Always,
}

/// Host lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Initialising,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl HostState {
    /// Validates a lifecycle transition. `Error` is reachable laterally from
    /// any non-terminal state.
    #[must_use]
    pub fn can_transition_to(&self, to: HostState) -> bool {
        use HostState::{Error, Initialising, Paused, Running, Starting, Stopped, Stopping};
        match (self, to) {
            (_, Error) => !matches!(self, Stopped),
            (Initialising, Starting) | (Stopped, Starting) | (Error, Starting) => true,
            (Starting, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused | Starting | Error, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialising => "initialising",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn session_id_formats() {
        let ingress = SessionId::ingress();
        assert!(ingress.as_str().starts_with("SES-"));
        assert!(!ingress.as_str().starts_with("SES-test-"));

        let test = SessionId::test_send();
        assert!(test.as_str().starts_with("SES-test-"));
    }

    #[test_log::test]
    fn session_id_rejects_foreign_prefix() {
        assert!(SessionId::try_new("sess-123".to_string()).is_err());
        assert!(SessionId::try_new("SES-abc".to_string()).is_ok());
    }

    #[test_log::test]
    fn item_name_trims_and_rejects_empty() {
        let name = ItemName::try_new("  HL7.In  ".to_string()).unwrap();
        assert_eq!(name.as_str(), "HL7.In");
        assert!(ItemName::try_new("   ".to_string()).is_err());
    }

    #[test_log::test]
    fn priority_ordering_for_queues() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test_log::test]
    fn terminal_states() {
        assert!(MessageState::Delivered.is_terminal());
        assert!(MessageState::DeadLettered.is_terminal());
        assert!(!MessageState::Processing.is_terminal());
        assert!(!MessageState::AwaitingReply.is_terminal());
    }

    #[test_log::test]
    fn host_state_machine() {
        assert!(HostState::Initialising.can_transition_to(HostState::Starting));
        assert!(HostState::Starting.can_transition_to(HostState::Running));
        assert!(HostState::Running.can_transition_to(HostState::Paused));
        assert!(HostState::Paused.can_transition_to(HostState::Running));
        assert!(HostState::Running.can_transition_to(HostState::Stopping));
        assert!(HostState::Stopping.can_transition_to(HostState::Stopped));
        assert!(HostState::Running.can_transition_to(HostState::Error));
        assert!(HostState::Error.can_transition_to(HostState::Starting));

        assert!(!HostState::Stopped.can_transition_to(HostState::Error));
        assert!(!HostState::Initialising.can_transition_to(HostState::Running));
    }

    #[test_log::test]
    fn queue_capacity_bounds() {
        assert!(QueueCapacity::try_new(0).is_err());
        assert!(QueueCapacity::try_new(1).is_ok());
        assert_eq!(QueueCapacity::default().as_usize(), 1000);
    }

    #[test_log::test]
    fn ack_mode_config_spelling() {
        let mode: AckMode = serde_json::from_str("\"Immediate\"").unwrap();
        assert_eq!(mode, AckMode::Immediate);
        let mode: AckMode = serde_json::from_str("\"Application\"").unwrap();
        assert_eq!(mode, AckMode::Application);
    }

    #[test_log::test]
    fn execution_mode_config_spelling() {
        let mode: ExecutionMode = serde_json::from_str("\"multi_process\"").unwrap();
        assert_eq!(mode, ExecutionMode::MultiProcess);
    }
}

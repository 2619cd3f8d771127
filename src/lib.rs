//! # Hermes — healthcare message integration engine
//!
//! A long-running service that receives clinical messages (HL7 v2 over
//! MLLP/TCP), routes them through configurable business logic, and delivers
//! them to downstream systems with durability, ordering and observability
//! guarantees.
//!
//! ## Architecture
//!
//! A deployed *production* is a graph of hosts — inbound Services, routing
//! Processes, outbound Operations — each an independent worker pool over a
//! bounded queue. The broker moves envelopes between hosts through the
//! service registry; every transition is appended to the write-ahead log
//! first and projected into a queryable SQLite message store; every host
//! visit emits a trace row keyed by the session id minted at ingress.
//!
//! ```text
//! bytes ──► Service (MLLP decode, session id, WAL, ACK)
//!               │ broker
//!               ▼
//!           Process (rule evaluation)
//!               │ broker
//!               ▼
//!           Operation (MLLP frame, deliver, ACK handling)
//! ```
//!
//! Hosts compose a shared base (lifecycle state machine, queue, workers,
//! hooks) with a pluggable [`host::HostBehaviour`]; the execution strategy —
//! cooperative tasks, OS threads, OS processes or a single debug worker —
//! never changes the worker-loop contract.

pub mod admin;
pub mod config;
pub mod database;
pub mod domain;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod hl7;
pub mod host;
pub mod hosts;
pub mod ipc;
pub mod mllp;
pub mod observability;
pub mod queue;
pub mod registry;
pub mod store;
pub mod trace;
pub mod wal;

pub use config::{ConfigRepository, FileConfigRepository, Item, ProductionDocument};
pub use domain::{
    AckMode, CorrelationId, Direction, ExecutionMode, HostState, ItemName, ItemType, MessageId,
    MessageState, MessagingPattern, OverflowPolicy, Priority, ProjectId, QueueKind, RestartPolicy,
    SessionId,
};
pub use engine::{EngineSettings, ProductionEngine};
pub use envelope::{Envelope, Payload};
pub use error::{EngineError, Result};
pub use host::{Host, HostBehaviour, ProcessOutcome};
pub use registry::{Broker, ServiceRegistry};
pub use store::{MessageStore, SqliteMessageStore};
pub use wal::Wal;

//! Inflow Runtime Engine
//!
//! This crate contains everything in the ingestion runtime that owns a thread,
//! a socket or a timer:
//! - `ProtocolReactor`: the shared event loop serving every listening port
//! - `SessionMultiplexer`, `ConnectionHandler` and `RequestCorrelator`
//! - `MessageProcessor` and the `ExecutionPool` engine submissions run on
//! - `LocalPollingRunner`, `CoordinatedScheduleDelegate` and the
//!   `StandaloneScheduler`
//! - `EndpointLifecycleManager` and the `RuntimeBuilder`
//!
//! `inflow-core` provides the types these components exchange.

pub mod builder;
pub mod managers;
pub mod processor;
pub mod reactor;
pub mod supervisor;
pub mod tasks;

pub use builder::{IngressRuntime, RuntimeBuilder};
pub use managers::*;
pub use processor::{
    ExecutionEngine, ExecutionPool, ExecutionRequest, MessageProcessor, ProcessOutcome,
    ProcessorSettings, Responder,
};
pub use reactor::{
    ByteSink, ByteSource, ConnectionLink, HandlerDirective, LinkCommand, ProtocolReactor,
    ReactorEvent, ReactorState,
};
pub use supervisor::{
    EndpointLifecycleManager, EndpointStatus, RunnerHandle, RunnerMode, DEFAULT_JOB_GROUP,
};
pub use tasks::{
    AlwaysLeader, CoordinatedScheduleDelegate, DistributedScheduler, JobListener, JobSpec,
    LocalPollingRunner, MembershipView, Schedule, StandaloneScheduler, TriggerState,
};

// Re-export core types for convenience
pub use inflow_core::{
    ConnectionKey, EndpointConfig, EndpointKind, InflowError, InflowResult, IngressConfig,
    MessageId, OutboundMessage, PollTask, Response,
};

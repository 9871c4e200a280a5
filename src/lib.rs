//! # Node Agent
//!
//! A node-local agent that receives desired task state from a remote control
//! plane, drives each task's containers through their lifecycle on the local
//! container runtime, and reports every state change back upstream with
//! at-least-once delivery.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Task and container model with the per-container state machine
//! - **[`dependency`]**: Static dependency validation and runtime gating
//! - **[`engine`]**: Task engine, one reconciling manager per task, checkpointing
//! - **[`reporting`]**: State change pipeline and the ack-tracking status sender
//! - **[`runtime`]**: Container runtime façade (Docker adapter and a scriptable mock)
//! - **[`channel`]**: Control-plane transport
//! - **[`agent`]**: Top-level wiring of all of the above
//!
//! ## Features
//!
//! ### Reconciliation
//! - **Monotonic status**: known status only moves forward, late events are ignored
//! - **Dependency gating**: START, COMPLETE, SUCCESS and HEALTHY conditions
//! - **Essential containers**: an essential container stopping stops its task
//! - **Retries**: bounded exponential backoff with jitter per runtime operation
//!
//! ### Reporting
//! - **Batching**: one message per task carrying task and container changes
//! - **At-least-once**: every batch is resent with the same token until acked
//! - **Resync**: the control plane can ask for a full re-emission
//!
//! ### Persistence
//! - **Checkpoints**: atomic JSON snapshots, restored and re-inspected on start
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use node_agent::{Agent, AgentConfig, ContainerSpec, MockRuntime, RecordingChannel, TaskSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(MockRuntime::new());
//!     let channel = Arc::new(RecordingChannel::new());
//!     let agent = Agent::start(AgentConfig::default(), runtime, channel).await?;
//!
//!     let task = TaskSpec::new("arn:task/web", "web")
//!         .with_container(ContainerSpec::new("app", "nginx:latest"));
//!     agent.submit(vec![task], 1).await;
//!
//!     agent.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Top-level agent wiring and configuration.
pub mod agent;

/// Retry policies shared by runtime operations and status delivery.
pub mod backoff;

/// Control-plane transport and message types.
pub mod channel;

/// Container dependency graph validation and resolution.
pub mod dependency;

/// Task engine, per-task managers and checkpointing.
pub mod engine;

/// Environment constants and path utilities.
///
/// Centralizes the hardcoded paths, file names and runtime labels used
/// throughout the agent.
pub mod env;

/// State change reporting with acknowledgement tracking.
pub mod reporting;

/// Container runtime abstraction.
pub mod runtime;

/// Task, container and resource model.
pub mod task;

// CLI module for command-line interface
pub mod cli;

pub use agent::{Agent, AgentConfig, ConfigError};
pub use backoff::BackoffPolicy;
pub use channel::{
    ChannelError, ControlPlaneChannel, InboundMessage, OutboundMessage, RecordingChannel,
    StdioChannel, read_inbound,
};
pub use dependency::DependencyError;
pub use engine::{
    Checkpoint, CheckpointConfig, CheckpointStore, EngineConfig, EngineError, PurgedTask,
    TaskEngine,
};
pub use reporting::{DeliveryNotice, ReportingConfig, StateChangeEvent, StatusSender};
#[cfg(feature = "docker")]
pub use runtime::DockerRuntime;
pub use runtime::{
    MockRuntime, ResourceProvisioner, RuntimeClient, RuntimeConfig, RuntimeError,
    RuntimeProvisioner,
};
pub use task::{
    AttachmentStatus, ContainerSpec, ContainerStatus, DependencyCondition, Task, TaskSpec,
    TaskStatus,
};

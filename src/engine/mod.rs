//! Task engine and per-task managers.
//!
//! The [`TaskEngine`] owns the routing index (task arn to manager, runtime id
//! to container) and nothing else. Every task is reconciled by its own
//! [`TaskManager`](manager::TaskManager) running as an independent tokio task;
//! desired-state updates, runtime events and delivery notices reach it through
//! a bounded queue, and runtime operation completions come back on an internal
//! channel so all state mutation happens on the manager's loop.

pub mod checkpoint;
pub mod manager;
pub mod task_engine;


pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore, PurgedTask};
pub use manager::{EngineNotice, ManagerMessage, TaskManager};
pub use task_engine::TaskEngine;

use crate::backoff::BackoffPolicy;
use crate::dependency::DependencyError;
use crate::task::RuntimeAction;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the task engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task {arn} rejected: {source}")]
    Validation {
        arn: String,
        #[source]
        source: DependencyError,
    },

    #[error("Stale payload for task {arn}: seq {seq_num} is behind {applied}")]
    StalePayload {
        arn: String,
        seq_num: u64,
        applied: u64,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Manager for task {0} is no longer running")]
    ManagerGone(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Task engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pull_timeout_secs: u64,
    pub create_timeout_secs: u64,
    pub start_timeout_secs: u64,
    /// Added on top of the container's stop grace period
    pub stop_timeout_buffer_secs: u64,
    pub remove_timeout_secs: u64,
    pub inspect_timeout_secs: u64,
    pub resource_timeout_secs: u64,
    /// Grace period handed to the runtime when a container doesn't set one
    pub default_stop_grace_secs: u64,
    pub container_retry: BackoffPolicy,
    pub resource_retry: BackoffPolicy,
    /// How long a stopped task's containers are kept before removal
    pub cleanup_wait_secs: u64,
    /// Purge anyway when the STOPPED report isn't acked within this window
    pub purge_ack_timeout_secs: u64,
    /// Capacity of each manager's inbound queue
    pub manager_queue_size: usize,
    /// Delay between attempts to resubscribe to the runtime event stream
    pub event_stream_retry: BackoffPolicy,
    /// How long a purged task's arn is remembered
    pub purged_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pull_timeout_secs: 600,
            create_timeout_secs: 240,
            start_timeout_secs: 180,
            stop_timeout_buffer_secs: 30,
            remove_timeout_secs: 120,
            inspect_timeout_secs: 30,
            resource_timeout_secs: 60,
            default_stop_grace_secs: 30,
            container_retry: BackoffPolicy::container_operations(),
            resource_retry: BackoffPolicy::task_resources(),
            cleanup_wait_secs: 600,
            purge_ack_timeout_secs: 300,
            manager_queue_size: 64,
            event_stream_retry: BackoffPolicy::event_stream(),
            purged_retention_secs: 3_600,
        }
    }
}

impl EngineConfig {
    /// Stop grace period for a container
    pub fn stop_grace(&self, container_stop_timeout: Option<u64>) -> Duration {
        Duration::from_secs(container_stop_timeout.unwrap_or(self.default_stop_grace_secs))
    }

    /// Deadline for one runtime operation
    pub fn operation_timeout(&self, action: RuntimeAction, stop_grace: Duration) -> Duration {
        match action {
            RuntimeAction::Pull => Duration::from_secs(self.pull_timeout_secs),
            RuntimeAction::Create => Duration::from_secs(self.create_timeout_secs),
            RuntimeAction::Start => Duration::from_secs(self.start_timeout_secs),
            RuntimeAction::Stop => stop_grace + Duration::from_secs(self.stop_timeout_buffer_secs),
            RuntimeAction::Remove => Duration::from_secs(self.remove_timeout_secs),
        }
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_secs(self.inspect_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    pub fn cleanup_wait(&self) -> Duration {
        Duration::from_secs(self.cleanup_wait_secs)
    }

    pub fn purge_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.purge_ack_timeout_secs)
    }

    pub fn purged_retention(&self) -> Duration {
        Duration::from_secs(self.purged_retention_secs)
    }
}

use crate::task::{
    AttachmentStatus, ContainerStatus, NetworkBinding, TaskSpec, TaskStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages received from the control plane
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Desired state for one or more tasks
    TaskPayload { tasks: Vec<TaskSpec>, seq_num: u64 },
    /// Acknowledgement of an outbound message, by token
    Ack { token: String },
    Heartbeat,
    /// Credentials of a task were rotated
    RefreshCredentials { task_arn: String },
    /// A task's network attachment changed state on the host
    AttachmentUpdate {
        task_arn: String,
        attachment_id: String,
        status: AttachmentStatus,
    },
    /// Re-send the current state of every task
    Resync,
}

/// Per-container entry of a task state change report
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerStateChange {
    pub container_name: String,
    pub runtime_id: Option<String>,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    #[serde(default)]
    pub network_bindings: Vec<NetworkBinding>,
}

/// Batched task and container state change report
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStateChange {
    /// Client-generated token, stable across retries of the same batch
    pub token: String,
    pub task_arn: String,
    /// Task status, when the batch carries a task transition
    pub status: Option<TaskStatus>,
    pub reason: Option<String>,
    pub containers: Vec<ContainerStateChange>,
    pub timestamp: DateTime<Utc>,
}

/// Network attachment state change report
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttachmentStateChange {
    pub token: String,
    pub task_arn: String,
    pub attachment_id: String,
    pub status: AttachmentStatus,
    pub timestamp: DateTime<Utc>,
}

/// Messages sent to the control plane
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    TaskStateChange(TaskStateChange),
    AttachmentStateChange(AttachmentStateChange),
}

impl OutboundMessage {
    pub fn token(&self) -> &str {
        match self {
            OutboundMessage::TaskStateChange(change) => &change.token,
            OutboundMessage::AttachmentStateChange(change) => &change.token,
        }
    }

    pub fn task_arn(&self) -> &str {
        match self {
            OutboundMessage::TaskStateChange(change) => &change.task_arn,
            OutboundMessage::AttachmentStateChange(change) => &change.task_arn,
        }
    }
}

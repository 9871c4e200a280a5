use crate::channel::ContainerStateChange;
use crate::task::{AttachmentStatus, ContainerStatus, NetworkBinding, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed task transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_arn: String,
    pub status: TaskStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Observed container transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub task_arn: String,
    pub container_name: String,
    pub runtime_id: Option<String>,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub network_bindings: Vec<NetworkBinding>,
    pub timestamp: DateTime<Utc>,
}

impl ContainerEvent {
    pub fn to_change(&self) -> ContainerStateChange {
        ContainerStateChange {
            container_name: self.container_name.clone(),
            runtime_id: self.runtime_id.clone(),
            status: self.status,
            exit_code: self.exit_code,
            reason: self.reason.clone(),
            network_bindings: self.network_bindings.clone(),
        }
    }
}

/// Observed network attachment transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentEvent {
    pub task_arn: String,
    pub attachment_id: String,
    pub status: AttachmentStatus,
    pub timestamp: DateTime<Utc>,
}

/// Immutable record of one observed transition, queued for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateChangeEvent {
    Task(TaskEvent),
    Container(ContainerEvent),
    Attachment(AttachmentEvent),
}

/// Entity an event describes; later events supersede pending earlier ones
/// for the same key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Task(String),
    Container(String, String),
    Attachment(String, String),
}

impl StateChangeEvent {
    pub fn task_arn(&self) -> &str {
        match self {
            StateChangeEvent::Task(e) => &e.task_arn,
            StateChangeEvent::Container(e) => &e.task_arn,
            StateChangeEvent::Attachment(e) => &e.task_arn,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            StateChangeEvent::Task(e) => EntityKey::Task(e.task_arn.clone()),
            StateChangeEvent::Container(e) => {
                EntityKey::Container(e.task_arn.clone(), e.container_name.clone())
            }
            StateChangeEvent::Attachment(e) => {
                EntityKey::Attachment(e.task_arn.clone(), e.attachment_id.clone())
            }
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StateChangeEvent::Task(e) => e.timestamp,
            StateChangeEvent::Container(e) => e.timestamp,
            StateChangeEvent::Attachment(e) => e.timestamp,
        }
    }
}

impl std::fmt::Display for StateChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateChangeEvent::Task(e) => write!(f, "task {} -> {}", e.task_arn, e.status),
            StateChangeEvent::Container(e) => write!(
                f,
                "container {}/{} -> {}",
                e.task_arn, e.container_name, e.status
            ),
            StateChangeEvent::Attachment(e) => write!(
                f,
                "attachment {}/{} -> {}",
                e.task_arn, e.attachment_id, e.status
            ),
        }
    }
}

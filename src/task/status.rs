use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a single container.
///
/// Variants are declared in lifecycle order; the derived `Ord` is the total
/// order used to reject regressions (`None < Pulled < Created < Running <
/// Stopped < Removed`).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    /// Nothing has happened yet
    #[default]
    None,
    /// Image is present on the host
    Pulled,
    /// Container exists in the runtime but has not been started
    Created,
    /// Container process is running
    Running,
    /// Container process has exited
    Stopped,
    /// Container has been removed from the runtime
    Removed,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::None => "NONE",
            ContainerStatus::Pulled => "PULLED",
            ContainerStatus::Created => "CREATED",
            ContainerStatus::Running => "RUNNING",
            ContainerStatus::Stopped => "STOPPED",
            ContainerStatus::Removed => "REMOVED",
        }
    }

    /// Container has exited (or been removed after exiting)
    pub fn is_stopped(self) -> bool {
        self >= ContainerStatus::Stopped
    }

    /// Whether the container exists in the runtime and might hold a process
    pub fn is_created(self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Running)
    }

    /// Statuses reported upstream. `None` carries no information and
    /// `Removed` is local housekeeping.
    pub fn is_reportable(self) -> bool {
        !matches!(self, ContainerStatus::None | ContainerStatus::Removed)
    }

    /// Task-level status this container status contributes to.
    pub fn task_status(self) -> TaskStatus {
        match self {
            ContainerStatus::None => TaskStatus::None,
            ContainerStatus::Pulled => TaskStatus::Pulled,
            ContainerStatus::Created => TaskStatus::Created,
            ContainerStatus::Running => TaskStatus::Running,
            ContainerStatus::Stopped | ContainerStatus::Removed => TaskStatus::Stopped,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task, derived from its containers.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    None,
    Pulled,
    Created,
    Running,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::None => "NONE",
            TaskStatus::Pulled => "PULLED",
            TaskStatus::Created => "CREATED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_reportable(self) -> bool {
        self != TaskStatus::None
    }

    /// Desired container status implied by a desired task status.
    pub fn container_status(self) -> ContainerStatus {
        match self {
            TaskStatus::None => ContainerStatus::None,
            TaskStatus::Pulled => ContainerStatus::Pulled,
            TaskStatus::Created => ContainerStatus::Created,
            TaskStatus::Running => ContainerStatus::Running,
            TaskStatus::Stopped => ContainerStatus::Stopped,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container health as reported by the runtime's health check.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Unhealthy => "UNHEALTHY",
        };
        f.write_str(s)
    }
}

/// Status of a task resource (volume, secret, credentials).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    #[default]
    None,
    Created,
    Removed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::None => "NONE",
            ResourceStatus::Created => "CREATED",
            ResourceStatus::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// Status of a network attachment (interface) belonging to a task.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentStatus {
    #[default]
    None,
    Attached,
    Detached,
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttachmentStatus::None => "NONE",
            AttachmentStatus::Attached => "ATTACHED",
            AttachmentStatus::Detached => "DETACHED",
        };
        f.write_str(s)
    }
}

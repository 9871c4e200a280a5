//! Container runtime façade.
//!
//! The engine only talks to the runtime through [`RuntimeClient`]; every
//! container operation returns a [`ContainerMetadata`] snapshot and the
//! asynchronous notifications (start, die, OOM, health) arrive as
//! [`RuntimeEvent`]s on the stream returned by [`RuntimeClient::events`].
//!
//! - [`docker`]: bollard-backed implementation (feature `docker`)
//! - [`mock`]: scriptable in-process implementation used by tests
//! - [`provisioner`]: task resource provisioning on top of the runtime

#[cfg(feature = "docker")]
pub mod docker;
pub mod mock;
pub mod provisioner;

#[cfg(test)]
mod tests;

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
pub use mock::{MockRuntime, Operation, RuntimeCall};
pub use provisioner::{ResourceProvisioner, RuntimeProvisioner};

use crate::env;
use crate::task::{
    Container, ContainerStatus, HealthCheckSpec, HealthStatus, NetworkBinding, PortMapping, Task,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Container runtime errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Container, image or volume does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Image could not be pulled
    #[error("Image pull failed for {image}: {message}")]
    PullFailed { image: String, message: String },

    /// Operation exceeded its deadline
    #[error("Runtime operation timed out after {0:?}")]
    Timeout(Duration),

    /// Runtime API returned an error
    #[error("Runtime API error: {0}")]
    Api(String),

    /// Runtime daemon cannot be reached
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// Request rejected as invalid
    #[error("Invalid container configuration: {0}")]
    InvalidConfig(String),
}

impl RuntimeError {
    /// Whether retrying the same operation can succeed
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            RuntimeError::NotFound(_) | RuntimeError::InvalidConfig(_)
        )
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit daemon endpoint (`unix:///...` or `tcp://...`); local
    /// defaults are used when unset
    pub docker_host: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            connect_timeout_secs: 120,
        }
    }
}

/// Volume bound into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    /// Runtime name of the task volume
    pub volume: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the runtime needs to create one container
#[derive(Debug, Clone, PartialEq)]
pub struct CreateContainerRequest {
    /// Runtime-level container name
    pub name: String,
    pub task_arn: String,
    /// Name from the task definition
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub binds: Vec<VolumeBind>,
    /// Runtime ids of siblings whose volumes are shared
    pub volumes_from: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub cpu_shares: Option<u32>,
    pub memory_mib: Option<u64>,
    pub health_check: Option<HealthCheckSpec>,
    pub labels: BTreeMap<String, String>,
}

impl CreateContainerRequest {
    /// Build the request for a container of `task`. Mounts resolve to the
    /// task-scoped volume names, `volumes_from` to sibling runtime ids.
    pub fn for_container(task: &Task, container: &Container) -> Self {
        let binds = container
            .spec
            .mounts
            .iter()
            .filter_map(|mount| {
                task.resource(&mount.source_volume).map(|resource| VolumeBind {
                    volume: resource.spec.runtime_name(&task.arn),
                    container_path: mount.container_path.clone(),
                    read_only: mount.read_only,
                })
            })
            .collect();

        let volumes_from = container
            .spec
            .volumes_from
            .iter()
            .filter_map(|name| task.container(name).and_then(|c| c.runtime_id.clone()))
            .collect();

        let mut labels = BTreeMap::new();
        labels.insert(env::runtime::LABEL_TASK_ARN.to_string(), task.arn.clone());
        labels.insert(
            env::runtime::LABEL_CONTAINER_NAME.to_string(),
            container.spec.name.clone(),
        );
        labels.insert(env::runtime::LABEL_MANAGED.to_string(), "true".to_string());

        Self {
            name: container.runtime_name(task),
            task_arn: task.arn.clone(),
            container_name: container.spec.name.clone(),
            image: container.spec.image.clone(),
            command: container.spec.command.clone(),
            env: container.spec.env.clone(),
            binds,
            volumes_from,
            ports: container.spec.ports.clone(),
            cpu_shares: container.spec.cpu_shares,
            memory_mib: container.spec.memory_mib,
            health_check: container.spec.health_check.clone(),
            labels,
        }
    }
}

/// Volume creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub name: String,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Container state as observed in the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub runtime_id: String,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub health: HealthStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub network_bindings: Vec<NetworkBinding>,
    #[serde(default)]
    pub oom_killed: bool,
}

impl ContainerMetadata {
    pub fn new(runtime_id: &str, status: ContainerStatus) -> Self {
        Self {
            runtime_id: runtime_id.to_string(),
            status,
            exit_code: None,
            health: HealthStatus::Unknown,
            started_at: None,
            finished_at: None,
            network_bindings: Vec::new(),
            oom_killed: false,
        }
    }
}

/// What happened to a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEventKind {
    Started,
    Died { exit_code: Option<i32> },
    Oom,
    Health(HealthStatus),
}

/// Asynchronous notification from the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub runtime_id: String,
    pub kind: RuntimeEventKind,
    pub observed_at: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(runtime_id: &str, kind: RuntimeEventKind) -> Self {
        Self {
            runtime_id: runtime_id.to_string(),
            kind,
            observed_at: Utc::now(),
        }
    }
}

/// Operations the engine needs from a container runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Make the image available locally
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container
    async fn create_container(&self, request: &CreateContainerRequest)
    -> Result<ContainerMetadata>;

    async fn start_container(&self, runtime_id: &str) -> Result<ContainerMetadata>;

    /// Stop a container, killing it once `timeout` elapses
    async fn stop_container(&self, runtime_id: &str, timeout: Duration)
    -> Result<ContainerMetadata>;

    async fn remove_container(&self, runtime_id: &str) -> Result<()>;

    async fn inspect_container(&self, runtime_id: &str) -> Result<ContainerMetadata>;

    async fn create_volume(&self, request: &VolumeRequest) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Stream of container notifications. Each call returns an independent
    /// subscription.
    fn events(&self) -> BoxStream<'static, RuntimeEvent>;
}

use crate::backoff::RetryState;
use crate::env;
use crate::task::resource::{ResourceSpec, TaskResource};
use crate::task::status::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition a container waits for on one of its siblings
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyCondition {
    /// Dependency is running (or has run)
    Start,
    /// Dependency has exited, whatever its exit code
    Complete,
    /// Dependency has exited with exit code 0
    Success,
    /// Dependency's health check reports healthy
    Healthy,
}

impl DependencyCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyCondition::Start => "START",
            DependencyCondition::Complete => "COMPLETE",
            DependencyCondition::Success => "SUCCESS",
            DependencyCondition::Healthy => "HEALTHY",
        }
    }
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared dependency edge on a sibling container
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DependsOn {
    pub container_name: String,
    pub condition: DependencyCondition,
}

/// Task volume mounted into a container
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MountPoint {
    pub source_volume: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Port exposed by a container
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    /// Host port; `None` lets the runtime pick one
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Host port actually bound by the runtime
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NetworkBinding {
    pub bind_ip: String,
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Health check run by the runtime inside the container
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub command: Vec<String>,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    #[serde(default)]
    pub start_period_secs: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_retries() -> u32 {
    3
}

fn default_essential() -> bool {
    true
}

/// Container definition as received from the control plane
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
    /// Siblings whose volumes this container mounts
    #[serde(default)]
    pub volumes_from: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Relative CPU shares
    #[serde(default)]
    pub cpu_shares: Option<u32>,
    /// Hard memory limit in MiB
    #[serde(default)]
    pub memory_mib: Option<u64>,
    #[serde(default = "default_essential")]
    pub essential: bool,
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    /// Names of secret resources this container consumes
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Grace period for stop before the runtime kills the process
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
}

impl ContainerSpec {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            volumes_from: Vec::new(),
            ports: Vec::new(),
            cpu_shares: None,
            memory_mib: None,
            essential: true,
            depends_on: Vec::new(),
            health_check: None,
            secrets: Vec::new(),
            stop_timeout_secs: None,
        }
    }

    /// Set the command to run
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Mark the container as non-essential
    pub fn non_essential(mut self) -> Self {
        self.essential = false;
        self
    }

    /// Add a dependency edge on a sibling
    pub fn depends_on(mut self, container_name: &str, condition: DependencyCondition) -> Self {
        self.depends_on.push(DependsOn {
            container_name: container_name.to_string(),
            condition,
        });
        self
    }

    /// Mount a task volume
    pub fn with_mount(mut self, source_volume: &str, container_path: &str) -> Self {
        self.mounts.push(MountPoint {
            source_volume: source_volume.to_string(),
            container_path: container_path.to_string(),
            read_only: false,
        });
        self
    }

    /// Share volumes with a sibling
    pub fn with_volumes_from(mut self, container_name: &str) -> Self {
        self.volumes_from.push(container_name.to_string());
        self
    }

    /// Consume a secret resource
    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secrets.push(secret.to_string());
        self
    }

    /// Attach a health check
    pub fn with_health_check(mut self, command: Vec<String>) -> Self {
        self.health_check = Some(HealthCheckSpec {
            command,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            retries: default_health_retries(),
            start_period_secs: 0,
        });
        self
    }

    /// Expose a port
    pub fn with_port(mut self, container_port: u16, host_port: Option<u16>) -> Self {
        self.ports.push(PortMapping {
            container_port,
            host_port,
            protocol: default_protocol(),
        });
        self
    }
}

/// Network attachment declared for a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub attachment_id: String,
    #[serde(default)]
    pub mac_address: Option<String>,
}

/// Task definition plus desired status, as received from the control plane
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskSpec {
    pub arn: String,
    pub family: String,
    #[serde(default)]
    pub version: String,
    pub desired_status: TaskStatus,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub attachments: Vec<AttachmentSpec>,
}

impl TaskSpec {
    pub fn new(arn: &str, family: &str) -> Self {
        Self {
            arn: arn.to_string(),
            family: family.to_string(),
            version: "1".to_string(),
            desired_status: TaskStatus::Running,
            containers: Vec::new(),
            resources: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Self {
        self.containers.push(container);
        self
    }

    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_attachment(mut self, attachment_id: &str) -> Self {
        self.attachments.push(AttachmentSpec {
            attachment_id: attachment_id.to_string(),
            mac_address: None,
        });
        self
    }

    pub fn with_desired_status(mut self, status: TaskStatus) -> Self {
        self.desired_status = status;
        self
    }
}

/// Container state owned by its task's manager
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Container {
    pub spec: ContainerSpec,
    /// Runtime handle, set once the container has been created
    pub runtime_id: Option<String>,
    pub desired_status: ContainerStatus,
    pub known_status: ContainerStatus,
    /// Status a runtime operation is currently in flight toward
    #[serde(skip)]
    pub applied_status: Option<ContainerStatus>,
    /// Last status acknowledged by the control plane
    pub sent_status: ContainerStatus,
    /// Status at which the container needs no further driving
    pub steady_state_status: ContainerStatus,
    pub health: HealthStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub network_bindings: Vec<NetworkBinding>,
    #[serde(skip)]
    pub retry: RetryState<ContainerStatus>,
}

impl Container {
    pub fn new(spec: ContainerSpec, desired_status: ContainerStatus) -> Self {
        Self {
            spec,
            runtime_id: None,
            desired_status,
            known_status: ContainerStatus::None,
            applied_status: None,
            sent_status: ContainerStatus::None,
            steady_state_status: ContainerStatus::Running,
            health: HealthStatus::Unknown,
            exit_code: None,
            reason: None,
            started_at: None,
            finished_at: None,
            network_bindings: Vec::new(),
            retry: RetryState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_essential(&self) -> bool {
        self.spec.essential
    }

    /// The container process was actually started at some point
    pub fn has_run(&self) -> bool {
        self.started_at.is_some() || self.exit_code.is_some()
    }

    /// Reached its steady state and is meant to stay there
    pub fn is_steady(&self) -> bool {
        self.known_status == self.steady_state_status
            && self.desired_status == self.steady_state_status
    }

    /// Whether a runtime operation is in flight for this container
    pub fn is_transitioning(&self) -> bool {
        self.applied_status.is_some()
    }

    /// Declared or implicit (`volumes_from`) dependency on `other`
    pub fn depends_on(&self, other: &str) -> bool {
        self.spec.depends_on.iter().any(|d| d.container_name == other)
            || self.spec.volumes_from.iter().any(|v| v == other)
    }

    /// Name used for the container in the runtime
    pub fn runtime_name(&self, task: &Task) -> String {
        sanitize_runtime_name(&format!(
            "{}-{}-{}-{}-{}",
            env::runtime::NAME_PREFIX,
            task.family,
            task.version,
            self.spec.name,
            short_task_id(&task.arn)
        ))
    }
}

/// Network attachment state
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Attachment {
    pub spec: AttachmentSpec,
    pub status: AttachmentStatus,
    pub sent_status: AttachmentStatus,
}

/// Task state owned by its manager
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    pub arn: String,
    pub family: String,
    pub version: String,
    /// Containers in definition order
    pub containers: Vec<Container>,
    pub resources: Vec<TaskResource>,
    pub attachments: Vec<Attachment>,
    pub desired_status: TaskStatus,
    pub known_status: TaskStatus,
    /// Last task status acknowledged by the control plane
    pub sent_status: TaskStatus,
    pub stop_reason: Option<String>,
    /// Sequence number of the last applied desired-state payload
    pub seq_num: u64,
    pub created_at: DateTime<Utc>,
    pub known_status_changed_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build fresh task state from a (validated) specification
    pub fn from_spec(spec: TaskSpec, seq_num: u64) -> Self {
        let now = Utc::now();
        let container_desired = spec.desired_status.container_status();
        let resource_desired = if spec.desired_status >= TaskStatus::Stopped {
            ResourceStatus::Removed
        } else {
            ResourceStatus::Created
        };

        Self {
            arn: spec.arn,
            family: spec.family,
            version: spec.version,
            containers: spec
                .containers
                .into_iter()
                .map(|c| Container::new(c, container_desired))
                .collect(),
            resources: spec
                .resources
                .into_iter()
                .map(|r| TaskResource::new(r, resource_desired))
                .collect(),
            attachments: spec
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    spec: a,
                    status: AttachmentStatus::None,
                    sent_status: AttachmentStatus::None,
                })
                .collect(),
            desired_status: spec.desired_status,
            known_status: TaskStatus::None,
            sent_status: TaskStatus::None,
            stop_reason: None,
            seq_num,
            created_at: now,
            known_status_changed_at: now,
            stopped_at: None,
        }
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.spec.name == name)
    }

    pub fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.containers.iter_mut().find(|c| c.spec.name == name)
    }

    pub fn container_index(&self, name: &str) -> Option<usize> {
        self.containers.iter().position(|c| c.spec.name == name)
    }

    pub fn container_by_runtime_id(&self, runtime_id: &str) -> Option<&Container> {
        self.containers
            .iter()
            .find(|c| c.runtime_id.as_deref() == Some(runtime_id))
    }

    pub fn resource(&self, name: &str) -> Option<&TaskResource> {
        self.resources.iter().find(|r| r.spec.name == name)
    }

    /// Task status implied by the containers: the minimum over their known
    /// statuses mapped to the task lifecycle.
    pub fn computed_known_status(&self) -> TaskStatus {
        self.containers
            .iter()
            .map(|c| c.known_status.task_status())
            .min()
            .unwrap_or(TaskStatus::None)
    }

    pub fn all_containers_removed(&self) -> bool {
        self.containers
            .iter()
            .all(|c| c.known_status == ContainerStatus::Removed)
    }

    pub fn all_resources_released(&self) -> bool {
        self.resources
            .iter()
            .all(|r| r.known_status != ResourceStatus::Created && !r.in_flight)
    }

    pub fn is_stopped(&self) -> bool {
        self.known_status == TaskStatus::Stopped
    }
}

/// Last segment of a task ARN (`arn:...:task/cluster/abc123` -> `abc123`)
pub fn short_task_id(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Restrict a name to the characters container runtimes accept
pub fn sanitize_runtime_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

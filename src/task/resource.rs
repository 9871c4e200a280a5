use crate::backoff::RetryState;
use crate::env;
use crate::task::status::ResourceStatus;
use crate::task::types::{sanitize_runtime_name, short_task_id};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of non-container dependency a task carries
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    /// Task-scoped volume created through the container runtime
    Volume {
        #[serde(default = "default_driver")]
        driver: String,
        #[serde(default)]
        driver_opts: BTreeMap<String, String>,
    },
    /// Secret materialized for the task's containers
    Secret { source: String },
    /// Task role credentials
    Credentials { credentials_id: String },
}

fn default_driver() -> String {
    "local".to_string()
}

/// Declared task resource
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: ResourceKind,
}

impl ResourceSpec {
    pub fn volume(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Volume {
                driver: default_driver(),
                driver_opts: BTreeMap::new(),
            },
        }
    }

    pub fn secret(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Secret {
                source: source.to_string(),
            },
        }
    }

    pub fn credentials(name: &str, credentials_id: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Credentials {
                credentials_id: credentials_id.to_string(),
            },
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ResourceKind::Volume { .. } => "volume",
            ResourceKind::Secret { .. } => "secret",
            ResourceKind::Credentials { .. } => "credentials",
        }
    }

    /// Name of the backing object in the runtime, scoped to the task
    pub fn runtime_name(&self, task_arn: &str) -> String {
        sanitize_runtime_name(&format!(
            "{}-{}-{}",
            env::runtime::NAME_PREFIX,
            short_task_id(task_arn),
            self.name
        ))
    }
}

/// Next step for a resource's NONE -> CREATED -> REMOVED machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    /// Create the backing object
    Provision,
    /// Tear the backing object down
    Release,
    /// Never created; record it as removed without touching the runtime
    MarkRemoved,
}

impl ResourceAction {
    pub fn target(self) -> ResourceStatus {
        match self {
            ResourceAction::Provision => ResourceStatus::Created,
            ResourceAction::Release | ResourceAction::MarkRemoved => ResourceStatus::Removed,
        }
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceAction::Provision => "provision",
            ResourceAction::Release => "release",
            ResourceAction::MarkRemoved => "mark-removed",
        };
        f.write_str(s)
    }
}

/// Pure lookup from (known, desired) to the next resource step
pub fn next_resource_action(
    known: ResourceStatus,
    desired: ResourceStatus,
) -> Option<ResourceAction> {
    match (known, desired) {
        (ResourceStatus::None, ResourceStatus::Created) => Some(ResourceAction::Provision),
        (ResourceStatus::None, ResourceStatus::Removed) => Some(ResourceAction::MarkRemoved),
        (ResourceStatus::Created, ResourceStatus::Removed) => Some(ResourceAction::Release),
        _ => None,
    }
}

/// Resource state owned by its task's manager
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskResource {
    pub spec: ResourceSpec,
    pub desired_status: ResourceStatus,
    pub known_status: ResourceStatus,
    #[serde(skip)]
    pub in_flight: bool,
    /// Set when provisioning gave up; dependents can no longer start
    pub error: Option<String>,
    #[serde(skip)]
    pub retry: RetryState<ResourceStatus>,
}

impl TaskResource {
    pub fn new(spec: ResourceSpec, desired_status: ResourceStatus) -> Self {
        Self {
            spec,
            desired_status,
            known_status: ResourceStatus::None,
            in_flight: false,
            error: None,
            retry: RetryState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_created(&self) -> bool {
        self.known_status == ResourceStatus::Created
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }
}

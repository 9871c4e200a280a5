//! Dependency graph resolution for containers within a task.
//!
//! Two separate concerns live here:
//!
//! - [`graph`]: static validation run once when a task is registered
//!   (unknown references, self edges, cycles) plus a topological order.
//! - [`resolver`]: the runtime question "may this container take its next
//!   step right now?", evaluated on every reconciliation pass. It never
//!   re-checks acyclicity.
//!
//! A container's dependencies are its declared `depends_on` edges, the
//! implicit edges from `volumes_from`, and the task resources it consumes
//! (mounted volumes, referenced secrets and the task credentials).

pub mod graph;
pub mod resolver;


pub use graph::{topological_order, validate};
pub use resolver::{dependencies_are_resolved, required_resources, resolvable};

use crate::task::DependencyCondition;

/// Dependency validation and resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// Dependency edges form a cycle
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// Edge references a container that is not part of the task
    #[error("Container '{container}' depends on unknown container '{dependency}'")]
    UnknownContainer {
        container: String,
        dependency: String,
    },

    /// Container depends on itself
    #[error("Container '{0}' depends on itself")]
    SelfDependency(String),

    /// Two containers share a name
    #[error("Duplicate container name '{0}'")]
    DuplicateContainer(String),

    /// Task has no containers at all
    #[error("Task has no containers")]
    NoContainers,

    /// Mount references a volume the task does not declare
    #[error("Container '{container}' mounts unknown volume '{volume}'")]
    UnknownVolume { container: String, volume: String },

    /// Container references a secret the task does not declare
    #[error("Container '{container}' references unknown secret '{secret}'")]
    UnknownSecret { container: String, secret: String },

    /// HEALTHY condition on a container without a health check
    #[error("Container '{container}' waits for '{dependency}' to be healthy but it has no health check")]
    HealthCheckMissing {
        container: String,
        dependency: String,
    },

    /// Dependency can never reach the state the condition requires
    #[error("Dependency '{dependency}' of container '{container}' can never satisfy {condition}")]
    Unresolvable {
        container: String,
        dependency: String,
        condition: DependencyCondition,
    },

    /// Required task resource gave up provisioning
    #[error("Resource '{resource}' required by container '{container}' failed to provision")]
    ResourceFailed { container: String, resource: String },
}

/// Result type for dependency operations.
pub type Result<T> = std::result::Result<T, DependencyError>;

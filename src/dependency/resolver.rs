use super::{DependencyError, Result};
use crate::task::{
    Container, ContainerStatus, DependencyCondition, HealthStatus, ResourceKind, RuntimeAction,
    TaskResource, TaskStatus,
};

/// Whether every dependency of `container` can still, eventually, satisfy
/// its condition. A container whose dependency stopped without ever running
/// (START), exited non-zero (SUCCESS) or stopped before turning healthy
/// (HEALTHY) will never be eligible.
pub fn resolvable(container: &Container, containers: &[Container]) -> bool {
    container.spec.depends_on.iter().all(|edge| {
        containers
            .iter()
            .find(|c| c.name() == edge.container_name)
            .is_some_and(|dep| can_still_satisfy(dep, edge.condition))
    }) && container
        .spec
        .volumes_from
        .iter()
        .all(|name| containers.iter().any(|c| c.name() == name))
}

/// Whether `container` may perform `action` right now.
///
/// `Ok(false)` means "wait and re-evaluate"; an error means the container can
/// never get there (unresolvable edge, failed resource).
pub fn dependencies_are_resolved(
    container: &Container,
    action: RuntimeAction,
    containers: &[Container],
    task_known_status: TaskStatus,
    resources: &[TaskResource],
) -> Result<bool> {
    match action {
        RuntimeAction::Pull => Ok(task_known_status < TaskStatus::Stopped),
        RuntimeAction::Create | RuntimeAction::Start => {
            if task_known_status >= TaskStatus::Stopped {
                return Ok(false);
            }
            if !resources_ready(container, resources)? {
                return Ok(false);
            }
            if !volumes_from_ready(container, containers) {
                return Ok(false);
            }
            declared_edges_ready(container, containers)
        }
        RuntimeAction::Stop => Ok(dependents_stopped(container, containers)),
        RuntimeAction::Remove => Ok(true),
    }
}

/// Task resources a container consumes: volumes it mounts, secrets it
/// references, and every credentials resource of the task.
pub fn required_resources<'a>(
    container: &'a Container,
    resources: &'a [TaskResource],
) -> impl Iterator<Item = &'a TaskResource> + 'a {
    resources.iter().filter(move |r| match &r.spec.kind {
        ResourceKind::Volume { .. } => container
            .spec
            .mounts
            .iter()
            .any(|m| m.source_volume == r.spec.name),
        ResourceKind::Secret { .. } => container.spec.secrets.contains(&r.spec.name),
        ResourceKind::Credentials { .. } => true,
    })
}

fn resources_ready(container: &Container, resources: &[TaskResource]) -> Result<bool> {
    let mut ready = true;
    for resource in required_resources(container, resources) {
        if resource.has_failed() {
            return Err(DependencyError::ResourceFailed {
                container: container.name().to_string(),
                resource: resource.name().to_string(),
            });
        }
        if !resource.is_created() {
            ready = false;
        }
    }
    Ok(ready)
}

fn volumes_from_ready(container: &Container, containers: &[Container]) -> bool {
    container.spec.volumes_from.iter().all(|name| {
        containers
            .iter()
            .find(|c| c.name() == name)
            .is_some_and(|dep| dep.known_status >= ContainerStatus::Created)
    })
}

fn declared_edges_ready(container: &Container, containers: &[Container]) -> Result<bool> {
    for edge in &container.spec.depends_on {
        let Some(dep) = containers.iter().find(|c| c.name() == edge.container_name) else {
            return Err(unresolvable(container, &edge.container_name, edge.condition));
        };

        if condition_met(dep, edge.condition) {
            continue;
        }
        if !can_still_satisfy(dep, edge.condition) {
            return Err(unresolvable(container, &edge.container_name, edge.condition));
        }
        return Ok(false);
    }
    Ok(true)
}

/// A container stops only after the siblings depending on it that are
/// themselves on their way down have stopped.
fn dependents_stopped(container: &Container, containers: &[Container]) -> bool {
    containers
        .iter()
        .filter(|c| c.name() != container.name() && c.depends_on(container.name()))
        .filter(|c| c.desired_status >= ContainerStatus::Stopped)
        .all(|c| !c.known_status.is_created())
}

fn condition_met(dep: &Container, condition: DependencyCondition) -> bool {
    match condition {
        DependencyCondition::Start => {
            dep.known_status == ContainerStatus::Running
                || (dep.known_status.is_stopped() && dep.has_run())
        }
        DependencyCondition::Complete => dep.known_status.is_stopped() && dep.exit_code.is_some(),
        DependencyCondition::Success => dep.known_status.is_stopped() && dep.exit_code == Some(0),
        DependencyCondition::Healthy => dep.health == HealthStatus::Healthy,
    }
}

fn can_still_satisfy(dep: &Container, condition: DependencyCondition) -> bool {
    if condition_met(dep, condition) {
        return true;
    }
    let finished = dep.known_status.is_stopped();
    let going_down = dep.desired_status >= ContainerStatus::Stopped;
    match condition {
        // it stopped without ever running, or will be stopped before it runs
        DependencyCondition::Start => !finished && !(going_down && !dep.has_run()),
        // a stopped container without an exit code never ran
        DependencyCondition::Complete => !finished,
        DependencyCondition::Success => !finished,
        DependencyCondition::Healthy => !finished && !going_down,
    }
}

fn unresolvable(
    container: &Container,
    dependency: &str,
    condition: DependencyCondition,
) -> DependencyError {
    DependencyError::Unresolvable {
        container: container.name().to_string(),
        dependency: dependency.to_string(),
        condition,
    }
}

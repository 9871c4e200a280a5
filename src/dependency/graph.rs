use super::{DependencyError, Result};
use crate::task::{DependencyCondition, ResourceKind, TaskSpec};
use std::collections::{HashMap, HashSet};

/// Validate a task specification's dependency graph.
///
/// Rejects duplicate names, unknown or self references, mounts of undeclared
/// volumes, references to undeclared secrets, HEALTHY edges on containers
/// without a health check, and cycles.
pub fn validate(spec: &TaskSpec) -> Result<()> {
    if spec.containers.is_empty() {
        return Err(DependencyError::NoContainers);
    }

    let mut names = HashSet::new();
    for container in &spec.containers {
        if !names.insert(container.name.as_str()) {
            return Err(DependencyError::DuplicateContainer(container.name.clone()));
        }
    }

    let volumes: HashSet<&str> = spec
        .resources
        .iter()
        .filter(|r| matches!(r.kind, ResourceKind::Volume { .. }))
        .map(|r| r.name.as_str())
        .collect();
    let secrets: HashSet<&str> = spec
        .resources
        .iter()
        .filter(|r| matches!(r.kind, ResourceKind::Secret { .. }))
        .map(|r| r.name.as_str())
        .collect();

    for container in &spec.containers {
        for dependency in edges(spec, &container.name) {
            if dependency == container.name {
                return Err(DependencyError::SelfDependency(container.name.clone()));
            }
            if !names.contains(dependency) {
                return Err(DependencyError::UnknownContainer {
                    container: container.name.clone(),
                    dependency: dependency.to_string(),
                });
            }
        }

        for edge in &container.depends_on {
            if edge.condition != DependencyCondition::Healthy {
                continue;
            }
            let has_check = spec
                .containers
                .iter()
                .any(|c| c.name == edge.container_name && c.health_check.is_some());
            if !has_check {
                return Err(DependencyError::HealthCheckMissing {
                    container: container.name.clone(),
                    dependency: edge.container_name.clone(),
                });
            }
        }

        for mount in &container.mounts {
            if !volumes.contains(mount.source_volume.as_str()) {
                return Err(DependencyError::UnknownVolume {
                    container: container.name.clone(),
                    volume: mount.source_volume.clone(),
                });
            }
        }

        for secret in &container.secrets {
            if !secrets.contains(secret.as_str()) {
                return Err(DependencyError::UnknownSecret {
                    container: container.name.clone(),
                    secret: secret.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(spec) {
        return Err(DependencyError::Cycle(cycle));
    }

    Ok(())
}

/// Container names in an order where every container follows its
/// dependencies. Ties keep definition order.
pub fn topological_order(spec: &TaskSpec) -> Result<Vec<String>> {
    validate(spec)?;

    let mut remaining: HashMap<&str, usize> = spec
        .containers
        .iter()
        .map(|c| {
            let unique: HashSet<&str> = edges(spec, &c.name).collect();
            (c.name.as_str(), unique.len())
        })
        .collect();

    let mut order = Vec::with_capacity(spec.containers.len());
    while order.len() < spec.containers.len() {
        let next = spec
            .containers
            .iter()
            .map(|c| c.name.as_str())
            .find(|name| remaining.get(name) == Some(&0));

        // validate() rules out cycles, so a ready container always exists
        let Some(next) = next else {
            return Err(DependencyError::Cycle(Vec::new()));
        };

        remaining.remove(next);
        for container in &spec.containers {
            if let Some(count) = remaining.get_mut(container.name.as_str()) {
                let unique: HashSet<&str> = edges(spec, &container.name).collect();
                if unique.contains(next) {
                    *count -= 1;
                }
            }
        }
        order.push(next.to_string());
    }

    Ok(order)
}

/// Declared and implicit dependency edges of one container
fn edges<'a>(spec: &'a TaskSpec, name: &str) -> impl Iterator<Item = &'a str> + use<'a> {
    let container = spec.containers.iter().find(|c| c.name == name);
    container.into_iter().flat_map(|c| {
        c.depends_on
            .iter()
            .map(|d| d.container_name.as_str())
            .chain(c.volumes_from.iter().map(String::as_str))
    })
}

fn find_cycle(spec: &TaskSpec) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    for container in &spec.containers {
        if let Some(cycle) = find_cycle_from(spec, &container.name, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn find_cycle_from<'a>(
    spec: &'a TaskSpec,
    name: &'a str,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(start) = path.iter().position(|n| *n == name) {
        let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
        cycle.push(name.to_string());
        return Some(cycle);
    }

    if visited.contains(name) {
        return None;
    }

    visited.insert(name);
    path.push(name);

    for dependency in edges(spec, name) {
        if let Some(cycle) = find_cycle_from(spec, dependency, visited, path) {
            return Some(cycle);
        }
    }

    path.pop();
    None
}

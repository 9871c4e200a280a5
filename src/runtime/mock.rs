//! Scriptable in-process runtime.
//!
//! Records every operation it receives, can be told to fail an operation a
//! number of times or to delay it, and lets callers inject runtime events
//! (exits, health changes) the way a real daemon would emit them. Containers
//! are identified in calls and helpers by their task definition name.

use super::{
    ContainerMetadata, CreateContainerRequest, Result, RuntimeClient, RuntimeError, RuntimeEvent,
    RuntimeEventKind, VolumeRequest,
};
use crate::task::{ContainerStatus, HealthStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedSender;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Runtime operation kinds recorded by [`MockRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    CreateVolume,
    RemoveVolume,
}

/// One recorded runtime call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub operation: Operation,
    /// Image for pulls, volume name for volume operations, container
    /// definition name otherwise
    pub target: String,
}

struct MockContainer {
    name: String,
    metadata: ContainerMetadata,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    calls: Vec<RuntimeCall>,
    failures: HashMap<(Operation, String), u32>,
    delays: HashMap<Operation, Duration>,
    stop_exit_codes: HashMap<String, i32>,
    volumes: HashSet<String>,
    next_id: u64,
    subscribers: Vec<UnboundedSender<RuntimeEvent>>,
    subscriptions: usize,
}

impl MockState {
    fn target_for(&self, runtime_id: &str) -> String {
        self.containers
            .get(runtime_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| runtime_id.to_string())
    }

    fn id_for(&self, name: &str) -> Option<String> {
        self.containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone())
    }

    fn emit(&mut self, event: RuntimeEvent) {
        self.subscribers
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

/// In-memory [`RuntimeClient`] for tests and dry runs.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `operation` on `target`
    pub fn fail_next(&self, operation: Operation, target: &str, times: u32) {
        self.state()
            .failures
            .insert((operation, target.to_string()), times);
    }

    /// Delay every call of `operation` by `delay`
    pub fn set_delay(&self, operation: Operation, delay: Duration) {
        self.state().delays.insert(operation, delay);
    }

    /// Exit code reported when `name` is stopped (defaults to 0)
    pub fn set_stop_exit_code(&self, name: &str, exit_code: i32) {
        self.state()
            .stop_exit_codes
            .insert(name.to_string(), exit_code);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `operation` on `target`
    pub fn count(&self, operation: Operation, target: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation && c.target == target)
            .count()
    }

    pub fn runtime_id(&self, name: &str) -> Option<String> {
        self.state().id_for(name)
    }

    pub fn status(&self, name: &str) -> Option<ContainerStatus> {
        let state = self.state();
        let id = state.id_for(name)?;
        state.containers.get(&id).map(|c| c.metadata.status)
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self.state().volumes.iter().cloned().collect();
        volumes.sort();
        volumes
    }

    /// Make the container's process exit and emit the matching `die` event
    pub fn exit(&self, name: &str, exit_code: i32) {
        let mut state = self.state();
        let Some(id) = state.id_for(name) else {
            return;
        };
        if let Some(container) = state.containers.get_mut(&id) {
            container.metadata.status = ContainerStatus::Stopped;
            container.metadata.exit_code = Some(exit_code);
            container.metadata.finished_at = Some(Utc::now());
        }
        state.emit(RuntimeEvent::new(
            &id,
            RuntimeEventKind::Died {
                exit_code: Some(exit_code),
            },
        ));
    }

    /// Change the container's health and emit a `health_status` event
    pub fn set_health(&self, name: &str, health: HealthStatus) {
        let mut state = self.state();
        let Some(id) = state.id_for(name) else {
            return;
        };
        if let Some(container) = state.containers.get_mut(&id) {
            container.metadata.health = health;
        }
        state.emit(RuntimeEvent::new(&id, RuntimeEventKind::Health(health)));
    }

    /// Deliver an arbitrary event to every subscriber
    pub fn emit(&self, event: RuntimeEvent) {
        self.state().emit(event);
    }

    /// End every open event stream, as a daemon restart would
    pub fn close_event_streams(&self) {
        self.state().subscribers.clear();
    }

    /// Number of event streams opened so far
    pub fn subscriptions(&self) -> usize {
        self.state().subscriptions
    }

    /// Drop the container without any event, as if removed behind the
    /// agent's back
    pub fn forget(&self, name: &str) {
        let mut state = self.state();
        if let Some(id) = state.id_for(name) {
            state.containers.remove(&id);
        }
    }

    async fn begin(&self, operation: Operation, target: &str) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.calls.push(RuntimeCall {
                operation,
                target: target.to_string(),
            });
            state.delays.get(&operation).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(remaining) = state.failures.get_mut(&(operation, target.to_string())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(match operation {
                    Operation::Pull => RuntimeError::PullFailed {
                        image: target.to_string(),
                        message: "injected failure".to_string(),
                    },
                    _ => RuntimeError::Api(format!("injected {:?} failure for {}", operation, target)),
                });
            }
        }
        Ok(())
    }

    fn metadata(&self, runtime_id: &str) -> Result<ContainerMetadata> {
        self.state()
            .containers
            .get(runtime_id)
            .map(|c| c.metadata.clone())
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        self.begin(Operation::Pull, image).await
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<ContainerMetadata> {
        self.begin(Operation::Create, &request.container_name).await?;

        let mut state = self.state();
        state.next_id += 1;
        let id = format!("mock-{:04}", state.next_id);
        let metadata = ContainerMetadata::new(&id, ContainerStatus::Created);
        state.containers.insert(
            id,
            MockContainer {
                name: request.container_name.clone(),
                metadata: metadata.clone(),
            },
        );
        Ok(metadata)
    }

    async fn start_container(&self, runtime_id: &str) -> Result<ContainerMetadata> {
        let target = self.state().target_for(runtime_id);
        self.begin(Operation::Start, &target).await?;

        let mut state = self.state();
        let container = state
            .containers
            .get_mut(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        container.metadata.status = ContainerStatus::Running;
        container.metadata.started_at = Some(Utc::now());
        let metadata = container.metadata.clone();
        state.emit(RuntimeEvent::new(runtime_id, RuntimeEventKind::Started));
        Ok(metadata)
    }

    async fn stop_container(
        &self,
        runtime_id: &str,
        _timeout: Duration,
    ) -> Result<ContainerMetadata> {
        let target = self.state().target_for(runtime_id);
        self.begin(Operation::Stop, &target).await?;

        let mut state = self.state();
        let exit_code = state.stop_exit_codes.get(&target).copied().unwrap_or(0);
        let container = state
            .containers
            .get_mut(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;

        let was_running = container.metadata.status == ContainerStatus::Running;
        if container.metadata.status < ContainerStatus::Stopped {
            container.metadata.status = ContainerStatus::Stopped;
            container.metadata.finished_at = Some(Utc::now());
            if was_running {
                container.metadata.exit_code = Some(exit_code);
            }
        }
        let metadata = container.metadata.clone();

        if was_running {
            state.emit(RuntimeEvent::new(
                runtime_id,
                RuntimeEventKind::Died {
                    exit_code: Some(exit_code),
                },
            ));
        }
        Ok(metadata)
    }

    async fn remove_container(&self, runtime_id: &str) -> Result<()> {
        let target = self.state().target_for(runtime_id);
        self.begin(Operation::Remove, &target).await?;

        self.state()
            .containers
            .remove(runtime_id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))
    }

    async fn inspect_container(&self, runtime_id: &str) -> Result<ContainerMetadata> {
        let target = self.state().target_for(runtime_id);
        self.begin(Operation::Inspect, &target).await?;
        self.metadata(runtime_id)
    }

    async fn create_volume(&self, request: &VolumeRequest) -> Result<()> {
        self.begin(Operation::CreateVolume, &request.name).await?;
        self.state().volumes.insert(request.name.clone());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.begin(Operation::RemoveVolume, name).await?;
        if self.state().volumes.remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    fn events(&self) -> BoxStream<'static, RuntimeEvent> {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut state = self.state();
        state.subscribers.push(tx);
        state.subscriptions += 1;
        rx.boxed()
    }
}

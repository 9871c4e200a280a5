use super::EngineConfig;
use crate::dependency::{dependencies_are_resolved, resolvable};
use crate::reporting::{AttachmentEvent, ContainerEvent, DeliveryNotice, StateChangeEvent, TaskEvent};
use crate::runtime::{
    ContainerMetadata, CreateContainerRequest, ResourceProvisioner, RuntimeClient, RuntimeError,
    RuntimeEvent, RuntimeEventKind,
};
use crate::task::{
    AttachmentStatus, ContainerStatus, HealthStatus, ResourceAction, ResourceStatus,
    RuntimeAction, Step, Task, TaskStatus, next_resource_action, next_step,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

pub(crate) const VANISHED_REASON: &str = "container no longer exists on host";
const OOM_REASON: &str = "OutOfMemoryError: container killed due to memory usage";
const STOP_REQUESTED_REASON: &str = "task stopped by request";

/// Input for a task manager, processed strictly one at a time
#[derive(Debug, Clone)]
pub enum ManagerMessage {
    /// New desired status from the control plane
    UpdateDesired {
        desired_status: TaskStatus,
        seq_num: u64,
    },
    /// Runtime event routed by runtime id
    Runtime {
        container_name: String,
        event: RuntimeEvent,
    },
    /// Fresh inspection of a container; `None` when the runtime no longer
    /// knows it
    Observed {
        container_name: String,
        metadata: Option<ContainerMetadata>,
    },
    Attachment {
        attachment_id: String,
        status: AttachmentStatus,
    },
    /// Outcome of a state change report for this task
    Delivered(DeliveryNotice),
    /// Re-emit current statuses
    Resync,
    Shutdown,
}

/// Notices sent from managers back to the engine's index
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    ContainerCreated {
        task_arn: String,
        container_name: String,
        runtime_id: String,
    },
    /// Cleanup finished; the task can leave the index
    TaskPurgeable { task_arn: String, seq_num: u64 },
}

/// Result of a runtime or provisioning call, applied on the manager loop
#[derive(Debug)]
enum Completion {
    Container {
        name: String,
        action: RuntimeAction,
        result: Result<Option<ContainerMetadata>, RuntimeError>,
    },
    Resource {
        name: String,
        action: ResourceAction,
        result: Result<(), RuntimeError>,
    },
}

/// One runtime call, captured with everything it needs so it can run off
/// the manager loop
enum Invocation {
    Pull(String),
    Create(Box<CreateContainerRequest>),
    Start(String),
    Stop(String, Duration),
    Remove(String),
}

impl Invocation {
    async fn call(
        self,
        runtime: &dyn RuntimeClient,
    ) -> Result<Option<ContainerMetadata>, RuntimeError> {
        match self {
            Invocation::Pull(image) => runtime.pull_image(&image).await.map(|()| None),
            Invocation::Create(request) => runtime.create_container(&request).await.map(Some),
            Invocation::Start(id) => runtime.start_container(&id).await.map(Some),
            Invocation::Stop(id, grace) => runtime.stop_container(&id, grace).await.map(Some),
            Invocation::Remove(id) => runtime.remove_container(&id).await.map(|()| None),
        }
    }
}

/// Reconciles one task toward its desired status.
///
/// The manager is the only writer of its task's state. Each loop iteration
/// takes one input (a message, an operation completion or a timer), then
/// re-evaluates every container and resource, issues at most one runtime
/// operation per entity, recomputes the task status and publishes any
/// observed transitions.
pub struct TaskManager {
    task: Task,
    runtime: Arc<dyn RuntimeClient>,
    provisioner: Arc<dyn ResourceProvisioner>,
    config: Arc<EngineConfig>,
    inbox: mpsc::Receiver<ManagerMessage>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    events: mpsc::Sender<StateChangeEvent>,
    notices: mpsc::UnboundedSender<EngineNotice>,
    snapshot: watch::Sender<Task>,
    outbox: Vec<StateChangeEvent>,
    cleanup_at: Option<Instant>,
    cleanup_started: bool,
    purge_deadline: Option<Instant>,
}

impl TaskManager {
    pub fn new(
        task: Task,
        runtime: Arc<dyn RuntimeClient>,
        provisioner: Arc<dyn ResourceProvisioner>,
        config: Arc<EngineConfig>,
        inbox: mpsc::Receiver<ManagerMessage>,
        events: mpsc::Sender<StateChangeEvent>,
        notices: mpsc::UnboundedSender<EngineNotice>,
    ) -> (Self, watch::Receiver<Task>) {
        let (snapshot, snapshot_rx) = watch::channel(task.clone());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut manager = Self {
            task,
            runtime,
            provisioner,
            config,
            inbox,
            completions_tx,
            completions_rx,
            events,
            notices,
            snapshot,
            outbox: Vec::new(),
            cleanup_at: None,
            cleanup_started: false,
            purge_deadline: None,
        };
        if manager.task.is_stopped() {
            manager.schedule_cleanup();
        }
        (manager, snapshot_rx)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub async fn run(mut self) {
        info!(
            "Task manager started for {} (desired {}, known {})",
            self.task.arn, self.task.desired_status, self.task.known_status
        );

        // state restored from a checkpoint may already call for a cascade
        for idx in 0..self.task.containers.len() {
            if self.task.containers[idx].known_status.is_stopped() {
                self.on_container_stopped(idx);
            }
        }
        self.emit_statuses(true);

        loop {
            self.reconcile();
            self.flush().await;

            if self.ready_to_purge() {
                if self.task.sent_status < TaskStatus::Stopped {
                    warn!(
                        "Purging task {} without an acknowledged STOPPED report",
                        self.task.arn
                    );
                } else {
                    info!("Task {} cleaned up", self.task.arn);
                }
                let _ = self.notices.send(EngineNotice::TaskPurgeable {
                    task_arn: self.task.arn.clone(),
                    seq_num: self.task.seq_num,
                });
                break;
            }

            let wake_at = self.next_wakeup();
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(ManagerMessage::Shutdown) | None => break,
                    Some(message) => self.handle_message(message),
                },
                Some(completion) = self.completions_rx.recv() => self.handle_completion(completion),
                _ = sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
            }
        }

        self.snapshot.send_replace(self.task.clone());
        debug!("Task manager for {} stopped", self.task.arn);
    }

    /// Hand queued events to the reporter, then publish the snapshot
    async fn flush(&mut self) {
        for event in std::mem::take(&mut self.outbox) {
            if self.events.send(event).await.is_err() {
                warn!(
                    "Status reporting is gone; dropping state changes for task {}",
                    self.task.arn
                );
                break;
            }
        }
        self.snapshot.send_replace(self.task.clone());
    }

    fn handle_message(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::UpdateDesired {
                desired_status,
                seq_num,
            } => self.update_desired(desired_status, seq_num),
            ManagerMessage::Runtime {
                container_name,
                event,
            } => self.on_runtime_event(&container_name, event),
            ManagerMessage::Observed {
                container_name,
                metadata,
            } => self.on_observed(&container_name, metadata),
            ManagerMessage::Attachment {
                attachment_id,
                status,
            } => self.on_attachment(&attachment_id, status),
            ManagerMessage::Delivered(notice) => self.on_delivery(notice),
            ManagerMessage::Resync => self.emit_statuses(false),
            ManagerMessage::Shutdown => {}
        }
    }

    fn update_desired(&mut self, desired: TaskStatus, seq_num: u64) {
        if seq_num < self.task.seq_num {
            debug!(
                "Ignoring desired status {} for task {}: seq {} is behind {}",
                desired, self.task.arn, seq_num, self.task.seq_num
            );
            return;
        }
        self.task.seq_num = seq_num;

        if desired <= self.task.desired_status {
            return;
        }
        if desired == TaskStatus::Stopped {
            self.stop_task(STOP_REQUESTED_REASON.to_string());
            return;
        }

        info!(
            "Task {} desired status {} -> {}",
            self.task.arn, self.task.desired_status, desired
        );
        self.task.desired_status = desired;
        let container_desired = desired.container_status();
        for container in &mut self.task.containers {
            if container.desired_status < container_desired {
                container.desired_status = container_desired;
            }
        }
    }

    /// Drive everything that can move without waiting on the runtime
    fn reconcile(&mut self) {
        loop {
            self.update_task_status();
            let now = Instant::now();
            let mut changed = self.progress_cleanup(now);
            changed |= self.progress_resources(now);
            changed |= self.progress_containers(now);
            if !changed {
                break;
            }
        }
        self.update_task_status();
    }

    fn progress_containers(&mut self, now: Instant) -> bool {
        let mut changed = false;

        for idx in 0..self.task.containers.len() {
            let container = &mut self.task.containers[idx];
            if container.is_steady()
                || container.is_transitioning()
                || container.retry.is_waiting(now)
            {
                continue;
            }
            container.retry.clear_schedule();
            let container = &self.task.containers[idx];

            if container.desired_status < ContainerStatus::Stopped
                && container.known_status < ContainerStatus::Running
                && !resolvable(container, &self.task.containers)
            {
                self.give_up(idx, "dependency can never be satisfied".to_string());
                changed = true;
                continue;
            }

            match next_step(container.known_status, container.desired_status) {
                Step::Satisfied => {}
                Step::MarkStopped => changed |= self.set_known(idx, ContainerStatus::Stopped),
                Step::Apply(action) => {
                    let resolved = dependencies_are_resolved(
                        container,
                        action,
                        &self.task.containers,
                        self.task.known_status,
                        &self.task.resources,
                    );
                    match resolved {
                        Ok(true) => changed |= self.issue(idx, action),
                        Ok(false) => trace!(
                            "Container {} of task {} waiting before {}",
                            container.name(),
                            self.task.arn,
                            action
                        ),
                        Err(e) => {
                            self.give_up(idx, e.to_string());
                            changed = true;
                        }
                    }
                }
            }
        }
        changed
    }

    /// Start `action` for a container. Returns true when the state changed
    /// synchronously instead.
    fn issue(&mut self, idx: usize, action: RuntimeAction) -> bool {
        let container = &self.task.containers[idx];
        let grace = self.config.stop_grace(container.spec.stop_timeout_secs);

        let invocation = match (action, container.runtime_id.clone()) {
            (RuntimeAction::Pull, _) => Invocation::Pull(container.spec.image.clone()),
            (RuntimeAction::Create, _) => Invocation::Create(Box::new(
                CreateContainerRequest::for_container(&self.task, container),
            )),
            (RuntimeAction::Start, Some(id)) => Invocation::Start(id),
            (RuntimeAction::Stop, Some(id)) => Invocation::Stop(id, grace),
            (RuntimeAction::Remove, Some(id)) => Invocation::Remove(id),
            (_, None) => {
                debug!(
                    "Container {} of task {} has no runtime handle; skipping {}",
                    container.name(),
                    self.task.arn,
                    action
                );
                let status = match action {
                    RuntimeAction::Remove => ContainerStatus::Removed,
                    _ => ContainerStatus::Stopped,
                };
                return self.set_known(idx, status);
            }
        };

        let name = container.name().to_string();
        let deadline = self.config.operation_timeout(action, grace);
        info!(
            "Issuing {} for container {} of task {}",
            action, name, self.task.arn
        );

        let container = &mut self.task.containers[idx];
        container.applied_status = Some(action.target());
        container.retry.clear_schedule();

        let runtime = Arc::clone(&self.runtime);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = match timeout(deadline, invocation.call(runtime.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout(deadline)),
            };
            let _ = completions.send(Completion::Container {
                name,
                action,
                result,
            });
        });
        false
    }

    fn progress_resources(&mut self, now: Instant) -> bool {
        let mut changed = false;
        let containers_removed = self.task.all_containers_removed();

        for idx in 0..self.task.resources.len() {
            let resource = &mut self.task.resources[idx];
            if resource.in_flight || resource.retry.is_waiting(now) {
                continue;
            }
            resource.retry.clear_schedule();
            match next_resource_action(resource.known_status, resource.desired_status) {
                None => {}
                Some(ResourceAction::MarkRemoved) => {
                    resource.known_status = ResourceStatus::Removed;
                    changed = true;
                }
                // containers go first
                Some(ResourceAction::Release) if !containers_removed => {}
                Some(action) => self.issue_resource(idx, action),
            }
        }
        changed
    }

    fn issue_resource(&mut self, idx: usize, action: ResourceAction) {
        let resource = &mut self.task.resources[idx];
        resource.in_flight = true;
        resource.retry.clear_schedule();

        let spec = resource.spec.clone();
        let task_arn = self.task.arn.clone();
        let deadline = self.config.resource_timeout();
        info!(
            "Issuing {} for {} {} of task {}",
            action,
            spec.kind_name(),
            spec.name,
            task_arn
        );

        let provisioner = Arc::clone(&self.provisioner);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let operation = async {
                match action {
                    ResourceAction::Provision => provisioner.provision(&task_arn, &spec).await,
                    ResourceAction::Release => provisioner.release(&task_arn, &spec).await,
                    ResourceAction::MarkRemoved => Ok(()),
                }
            };
            let result = timeout(deadline, operation)
                .await
                .unwrap_or_else(|_| Err(RuntimeError::Timeout(deadline)));
            let _ = completions.send(Completion::Resource {
                name: spec.name,
                action,
                result,
            });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Container {
                name,
                action,
                result,
            } => self.on_container_completion(&name, action, result),
            Completion::Resource {
                name,
                action,
                result,
            } => self.on_resource_completion(&name, action, result),
        }
    }

    fn on_container_completion(
        &mut self,
        name: &str,
        action: RuntimeAction,
        result: Result<Option<ContainerMetadata>, RuntimeError>,
    ) {
        let Some(idx) = self.task.container_index(name) else {
            return;
        };
        self.task.containers[idx].applied_status = None;

        match result {
            Ok(metadata) => {
                debug!(
                    "{} of container {} in task {} completed",
                    action, name, self.task.arn
                );
                self.task.containers[idx].retry.reset();
                let mut status = action.target();
                if let Some(metadata) = metadata {
                    self.absorb_metadata(idx, &metadata);
                    status = status.max(metadata.status);
                }
                self.set_known(idx, status);
            }
            Err(RuntimeError::NotFound(_)) if action == RuntimeAction::Remove => {
                self.set_known(idx, ContainerStatus::Removed);
            }
            Err(RuntimeError::NotFound(_))
                if matches!(action, RuntimeAction::Start | RuntimeAction::Stop) =>
            {
                warn!(
                    "Container {} of task {} disappeared from the runtime",
                    name, self.task.arn
                );
                self.give_up(idx, VANISHED_REASON.to_string());
                self.set_known(idx, ContainerStatus::Stopped);
            }
            Err(e) => self.on_container_failure(idx, action, e),
        }
    }

    fn absorb_metadata(&mut self, idx: usize, metadata: &ContainerMetadata) {
        let container = &mut self.task.containers[idx];
        if container.runtime_id.is_none() {
            container.runtime_id = Some(metadata.runtime_id.clone());
            let _ = self.notices.send(EngineNotice::ContainerCreated {
                task_arn: self.task.arn.clone(),
                container_name: container.spec.name.clone(),
                runtime_id: metadata.runtime_id.clone(),
            });
        }
        if metadata.status.is_stopped() && container.exit_code.is_none() {
            container.exit_code = metadata.exit_code;
        }
        if container.started_at.is_none() {
            container.started_at = metadata.started_at;
        }
        if container.finished_at.is_none() {
            container.finished_at = metadata.finished_at;
        }
        if metadata.health != HealthStatus::Unknown {
            container.health = metadata.health;
        }
        if !metadata.network_bindings.is_empty() {
            container.network_bindings = metadata.network_bindings.clone();
        }
        if metadata.oom_killed {
            container.reason.get_or_insert_with(|| OOM_REASON.to_string());
        }
    }

    fn on_container_failure(&mut self, idx: usize, action: RuntimeAction, error: RuntimeError) {
        let policy = &self.config.container_retry;
        let container = &mut self.task.containers[idx];
        let attempts = container.retry.record_failure(action.target());

        if error.retryable() && !policy.exhausted(attempts) {
            let delay = policy.delay_for(attempts);
            warn!(
                "{} of container {} in task {} failed (attempt {}/{}): {}; retrying in {:?}",
                action,
                container.spec.name,
                self.task.arn,
                attempts,
                policy.max_attempts,
                error,
                delay
            );
            container.retry.schedule(Instant::now() + delay);
            return;
        }

        error!(
            "Giving up on {} of container {} in task {} after {} attempt(s): {}",
            action, container.spec.name, self.task.arn, attempts, error
        );
        container.retry.reset();
        match action {
            RuntimeAction::Stop => {
                container
                    .reason
                    .get_or_insert_with(|| format!("stop failed: {}", error));
                self.set_known(idx, ContainerStatus::Stopped);
            }
            RuntimeAction::Remove => {
                self.set_known(idx, ContainerStatus::Removed);
            }
            _ => self.give_up(idx, format!("{} failed: {}", action, error)),
        }
    }

    /// The container won't reach its desired status; stop it instead
    fn give_up(&mut self, idx: usize, reason: String) {
        let container = &mut self.task.containers[idx];
        warn!(
            "Container {} of task {} will not reach {}: {}",
            container.spec.name, self.task.arn, container.desired_status, reason
        );
        if container.desired_status < ContainerStatus::Stopped {
            container.desired_status = ContainerStatus::Stopped;
        }
        container.reason.get_or_insert(reason);
    }

    /// Move a container's known status forward. Stale (non-increasing)
    /// updates are dropped.
    fn set_known(&mut self, idx: usize, status: ContainerStatus) -> bool {
        let container = &mut self.task.containers[idx];
        let previous = container.known_status;
        if status <= previous {
            debug!(
                "Ignoring stale {} for container {} of task {} (already {})",
                status, container.spec.name, self.task.arn, previous
            );
            return false;
        }

        container.known_status = status;
        if status == ContainerStatus::Running && container.started_at.is_none() {
            container.started_at = Some(Utc::now());
        }
        if status.is_stopped() {
            if container.finished_at.is_none() {
                container.finished_at = Some(Utc::now());
            }
            if container.desired_status < ContainerStatus::Stopped {
                container.desired_status = ContainerStatus::Stopped;
            }
        }
        info!(
            "Container {} of task {}: {} -> {}",
            container.spec.name, self.task.arn, previous, status
        );

        if status.is_reportable() {
            self.emit_container(idx);
        }
        if status.is_stopped() && !previous.is_stopped() {
            self.on_container_stopped(idx);
        }
        true
    }

    /// Essential container exit cascades to the whole task
    fn on_container_stopped(&mut self, idx: usize) {
        let container = &self.task.containers[idx];
        if !container.is_essential() || self.task.desired_status >= TaskStatus::Stopped {
            return;
        }

        let reason = match (container.exit_code, &container.reason) {
            (Some(code), _) => format!(
                "essential container {} exited with code {}",
                container.spec.name, code
            ),
            (None, Some(reason)) => format!(
                "essential container {} stopped: {}",
                container.spec.name, reason
            ),
            (None, None) => format!("essential container {} stopped", container.spec.name),
        };
        self.stop_task(reason);
    }

    /// Force every container (and unprovisioned resource) toward STOPPED
    fn stop_task(&mut self, reason: String) {
        if self.task.desired_status >= TaskStatus::Stopped {
            return;
        }
        info!("Stopping task {}: {}", self.task.arn, reason);
        self.task.desired_status = TaskStatus::Stopped;
        self.task.stop_reason.get_or_insert(reason);

        for container in &mut self.task.containers {
            if container.desired_status < ContainerStatus::Stopped {
                container.desired_status = ContainerStatus::Stopped;
            }
        }
        for resource in &mut self.task.resources {
            if resource.known_status == ResourceStatus::None && !resource.in_flight {
                resource.desired_status = ResourceStatus::Removed;
            }
        }
    }

    fn on_resource_completion(
        &mut self,
        name: &str,
        action: ResourceAction,
        result: Result<(), RuntimeError>,
    ) {
        let Some(idx) = self.task.resources.iter().position(|r| r.name() == name) else {
            return;
        };
        let resource = &mut self.task.resources[idx];
        resource.in_flight = false;

        match result {
            Ok(()) => {
                resource.retry.reset();
                if action.target() > resource.known_status {
                    resource.known_status = action.target();
                    info!(
                        "Resource {} of task {} is {}",
                        name, self.task.arn, resource.known_status
                    );
                }
            }
            Err(error) => self.on_resource_failure(idx, action, error),
        }
    }

    fn on_resource_failure(&mut self, idx: usize, action: ResourceAction, error: RuntimeError) {
        let policy = &self.config.resource_retry;
        let resource = &mut self.task.resources[idx];
        let attempts = resource.retry.record_failure(action.target());

        if error.retryable() && !policy.exhausted(attempts) {
            let delay = policy.delay_for(attempts);
            warn!(
                "{} of resource {} in task {} failed (attempt {}/{}): {}; retrying in {:?}",
                action,
                resource.spec.name,
                self.task.arn,
                attempts,
                policy.max_attempts,
                error,
                delay
            );
            resource.retry.schedule(Instant::now() + delay);
            return;
        }
        resource.retry.reset();

        match action {
            ResourceAction::Provision => {
                let reason = format!(
                    "resource provisioning failed: {}: {}",
                    resource.spec.name, error
                );
                error!("Task {}: {}", self.task.arn, reason);
                resource.error = Some(error.to_string());
                self.stop_task(reason);
            }
            _ => {
                warn!(
                    "Giving up on releasing resource {} of task {}: {}",
                    resource.spec.name, self.task.arn, error
                );
                resource.known_status = ResourceStatus::Removed;
            }
        }
    }

    fn on_runtime_event(&mut self, container_name: &str, event: RuntimeEvent) {
        let Some(idx) = self.task.container_index(container_name) else {
            debug!(
                "Task {} has no container {}; dropping event",
                self.task.arn, container_name
            );
            return;
        };

        match event.kind {
            RuntimeEventKind::Started => {
                let container = &mut self.task.containers[idx];
                container.started_at.get_or_insert(event.observed_at);
                self.set_known(idx, ContainerStatus::Running);
            }
            RuntimeEventKind::Died { exit_code } => {
                let container = &mut self.task.containers[idx];
                if container.exit_code.is_none() {
                    container.exit_code = exit_code;
                }
                container.finished_at.get_or_insert(event.observed_at);
                self.set_known(idx, ContainerStatus::Stopped);
            }
            RuntimeEventKind::Oom => {
                let container = &mut self.task.containers[idx];
                warn!(
                    "Container {} of task {} ran out of memory",
                    container.spec.name, self.task.arn
                );
                container.reason.get_or_insert_with(|| OOM_REASON.to_string());
            }
            RuntimeEventKind::Health(health) => {
                let container = &mut self.task.containers[idx];
                if container.health != health {
                    info!(
                        "Container {} of task {} is {}",
                        container.spec.name, self.task.arn, health
                    );
                    container.health = health;
                }
            }
        }
    }

    fn on_observed(&mut self, container_name: &str, metadata: Option<ContainerMetadata>) {
        let Some(idx) = self.task.container_index(container_name) else {
            return;
        };

        match metadata {
            Some(metadata) => {
                self.absorb_metadata(idx, &metadata);
                self.set_known(idx, metadata.status);
            }
            None if self.task.containers[idx].known_status < ContainerStatus::Stopped => {
                warn!(
                    "Container {} of task {} disappeared from the runtime",
                    container_name, self.task.arn
                );
                self.give_up(idx, VANISHED_REASON.to_string());
                self.set_known(idx, ContainerStatus::Stopped);
            }
            None => {}
        }
    }

    fn on_attachment(&mut self, attachment_id: &str, status: AttachmentStatus) {
        let Some(attachment) = self
            .task
            .attachments
            .iter_mut()
            .find(|a| a.spec.attachment_id == attachment_id)
        else {
            warn!(
                "Task {} has no attachment {}; ignoring {}",
                self.task.arn, attachment_id, status
            );
            return;
        };
        if status <= attachment.status {
            return;
        }
        attachment.status = status;
        self.outbox.push(StateChangeEvent::Attachment(AttachmentEvent {
            task_arn: self.task.arn.clone(),
            attachment_id: attachment_id.to_string(),
            status,
            timestamp: Utc::now(),
        }));
    }

    fn on_delivery(&mut self, notice: DeliveryNotice) {
        match notice {
            DeliveryNotice::Delivered {
                task_status,
                containers,
                attachments,
                ..
            } => {
                if let Some(status) = task_status {
                    self.task.sent_status = self.task.sent_status.max(status);
                }
                for (name, status) in containers {
                    if let Some(container) = self.task.container_mut(&name) {
                        container.sent_status = container.sent_status.max(status);
                    }
                }
                for (id, status) in attachments {
                    if let Some(attachment) = self
                        .task
                        .attachments
                        .iter_mut()
                        .find(|a| a.spec.attachment_id == id)
                    {
                        attachment.sent_status = attachment.sent_status.max(status);
                    }
                }
            }
            DeliveryNotice::Abandoned { token, .. } => debug!(
                "Report for task {} was abandoned (token {}); waiting for resync",
                self.task.arn, token
            ),
        }
    }

    fn update_task_status(&mut self) {
        let computed = self.task.computed_known_status();
        let previous = self.task.known_status;
        if computed <= previous {
            return;
        }

        self.task.known_status = computed;
        self.task.known_status_changed_at = Utc::now();
        info!("Task {}: {} -> {}", self.task.arn, previous, computed);

        if computed == TaskStatus::Stopped {
            self.task.stopped_at = Some(Utc::now());
            if self.task.desired_status < TaskStatus::Stopped {
                self.task.desired_status = TaskStatus::Stopped;
            }
            self.schedule_cleanup();
        }
        self.emit_task();
    }

    /// Arm the cleanup and purge timers, counting from when the task stopped
    fn schedule_cleanup(&mut self) {
        let elapsed = self
            .task
            .stopped_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or_default();
        let now = Instant::now();
        self.cleanup_at = Some(now + self.config.cleanup_wait().saturating_sub(elapsed));
        self.purge_deadline = Some(now + self.config.purge_ack_timeout().saturating_sub(elapsed));
    }

    fn progress_cleanup(&mut self, now: Instant) -> bool {
        if self.cleanup_started || !self.task.is_stopped() {
            return false;
        }
        if !self.cleanup_at.is_some_and(|at| at <= now) {
            return false;
        }

        info!("Cleaning up task {}", self.task.arn);
        self.cleanup_started = true;
        for container in &mut self.task.containers {
            container.desired_status = ContainerStatus::Removed;
        }
        for resource in &mut self.task.resources {
            resource.desired_status = ResourceStatus::Removed;
        }
        true
    }

    fn ready_to_purge(&self) -> bool {
        self.cleanup_started
            && self.task.all_containers_removed()
            && self.task.all_resources_released()
            && (self.task.sent_status >= TaskStatus::Stopped
                || self.purge_deadline.is_some_and(|at| at <= Instant::now()))
    }

    /// Earliest timer the loop has to wake up for. Elapsed retry schedules
    /// are cleared by `reconcile`, so everything here is still pending.
    fn next_wakeup(&self) -> Option<Instant> {
        let retries = self
            .task
            .containers
            .iter()
            .filter_map(|c| c.retry.next_attempt_at())
            .chain(
                self.task
                    .resources
                    .iter()
                    .filter_map(|r| r.retry.next_attempt_at()),
            );
        let cleanup = self.cleanup_at.filter(|_| !self.cleanup_started);
        let purge = self.purge_deadline.filter(|_| {
            self.cleanup_started
                && self.task.all_containers_removed()
                && self.task.all_resources_released()
                && self.task.sent_status < TaskStatus::Stopped
        });

        retries.chain(cleanup).chain(purge).min()
    }

    fn emit_container(&mut self, idx: usize) {
        let container = &self.task.containers[idx];
        self.outbox.push(StateChangeEvent::Container(ContainerEvent {
            task_arn: self.task.arn.clone(),
            container_name: container.spec.name.clone(),
            runtime_id: container.runtime_id.clone(),
            status: container.known_status,
            exit_code: container.exit_code,
            reason: container.reason.clone(),
            network_bindings: container.network_bindings.clone(),
            timestamp: Utc::now(),
        }));
    }

    fn emit_task(&mut self) {
        let reason = if self.task.known_status == TaskStatus::Stopped {
            self.task.stop_reason.clone()
        } else {
            None
        };
        self.outbox.push(StateChangeEvent::Task(TaskEvent {
            task_arn: self.task.arn.clone(),
            status: self.task.known_status,
            reason,
            timestamp: Utc::now(),
        }));
    }

    /// Queue current statuses; with `unsent_only`, just those the control
    /// plane hasn't acknowledged
    fn emit_statuses(&mut self, unsent_only: bool) {
        for attachment in &self.task.attachments {
            if attachment.status != AttachmentStatus::None
                && (!unsent_only || attachment.status > attachment.sent_status)
            {
                self.outbox.push(StateChangeEvent::Attachment(AttachmentEvent {
                    task_arn: self.task.arn.clone(),
                    attachment_id: attachment.spec.attachment_id.clone(),
                    status: attachment.status,
                    timestamp: Utc::now(),
                }));
            }
        }
        for idx in 0..self.task.containers.len() {
            let container = &self.task.containers[idx];
            if container.known_status.is_reportable()
                && (!unsent_only || container.known_status > container.sent_status)
            {
                self.emit_container(idx);
            }
        }
        if self.task.known_status.is_reportable()
            && (!unsent_only || self.task.known_status > self.task.sent_status)
        {
            self.emit_task();
        }
    }
}

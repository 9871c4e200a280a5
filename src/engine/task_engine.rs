use super::checkpoint::{Checkpoint, CheckpointStore, PurgedTask};
use super::manager::{EngineNotice, ManagerMessage, TaskManager, VANISHED_REASON};
use super::{EngineConfig, EngineError, Result};
use crate::dependency::validate;
use crate::reporting::{DeliveryNotice, StateChangeEvent, TaskEvent};
use crate::runtime::{ResourceProvisioner, RuntimeClient, RuntimeError, RuntimeEvent};
use crate::task::{AttachmentStatus, ContainerStatus, HealthStatus, Task, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

const MANAGER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct ManagerEntry {
    inbox: mpsc::Sender<ManagerMessage>,
    snapshot: watch::Receiver<Task>,
    handle: Option<JoinHandle<()>>,
    seq_num: u64,
}

struct Inner {
    runtime: Arc<dyn RuntimeClient>,
    provisioner: Arc<dyn ResourceProvisioner>,
    config: Arc<EngineConfig>,
    managers: RwLock<HashMap<String, ManagerEntry>>,
    /// runtime id -> (task arn, container name)
    containers: DashMap<String, (String, String)>,
    /// Purged task arns with the last sequence number they were seen at and
    /// when they left
    purged: DashMap<String, (u64, DateTime<Utc>)>,
    events: mpsc::Sender<StateChangeEvent>,
    notices: mpsc::UnboundedSender<EngineNotice>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineNotice>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Routes desired state and runtime events to per-task managers.
///
/// The engine never touches task state itself: it validates and registers
/// new tasks, keeps the lookup tables used for routing and reads the
/// snapshots each manager publishes.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<Inner>,
}

impl TaskEngine {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        provisioner: Arc<dyn ResourceProvisioner>,
        config: EngineConfig,
        events: mpsc::Sender<StateChangeEvent>,
    ) -> Self {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                runtime,
                provisioner,
                config: Arc::new(config),
                managers: RwLock::new(HashMap::new()),
                containers: DashMap::new(),
                purged: DashMap::new(),
                events,
                notices,
                notices_rx: Mutex::new(Some(notices_rx)),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start the routing loops (manager notices and the runtime event
    /// stream). Calling it again is a no-op.
    pub fn start(&self) {
        let notices = self
            .inner
            .notices_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut notices) = notices else {
            return;
        };

        let engine = self.clone();
        let notice_loop = tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                engine.on_notice(notice).await;
            }
        });

        let engine = self.clone();
        let event_loop = tokio::spawn(async move { engine.watch_runtime_events().await });

        self.inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([notice_loop, event_loop]);
        debug!("Task engine started");
    }

    /// Apply one task from a desired-state payload.
    ///
    /// Unknown tasks are validated and registered; known tasks get the new
    /// desired status forwarded. Payloads behind the sequence number already
    /// applied for the task are rejected as stale.
    pub async fn handle_payload(&self, spec: TaskSpec, seq_num: u64) -> Result<()> {
        let arn = spec.arn.clone();

        if let Some(purged_seq) = self.purged_seq(&arn) {
            debug!(
                "Ignoring payload (seq {}) for task {} purged at seq {}",
                seq_num, arn, purged_seq
            );
            return Ok(());
        }

        if self.inner.managers.read().await.contains_key(&arn) {
            return self.forward_desired(&arn, spec.desired_status, seq_num).await;
        }

        if let Err(source) = validate(&spec) {
            warn!("Rejecting task {}: {}", arn, source);
            let _ = self
                .inner
                .events
                .send(StateChangeEvent::Task(TaskEvent {
                    task_arn: arn.clone(),
                    status: TaskStatus::Stopped,
                    reason: Some(format!("invalid task definition: {}", source)),
                    timestamp: Utc::now(),
                }))
                .await;
            return Err(EngineError::Validation { arn, source });
        }

        if spec.desired_status >= TaskStatus::Stopped {
            debug!("Ignoring STOPPED payload for unknown task {}", arn);
            return Ok(());
        }

        let mut managers = self.inner.managers.write().await;
        if managers.contains_key(&arn) {
            drop(managers);
            return self.forward_desired(&arn, spec.desired_status, seq_num).await;
        }

        info!(
            "Registering task {} ({}:{}) with {} container(s), desired {}",
            arn,
            spec.family,
            spec.version,
            spec.containers.len(),
            spec.desired_status
        );
        self.spawn_manager(&mut managers, Task::from_spec(spec, seq_num));
        Ok(())
    }

    async fn forward_desired(&self, arn: &str, desired: TaskStatus, seq_num: u64) -> Result<()> {
        let inbox = {
            let mut managers = self.inner.managers.write().await;
            let entry = managers
                .get_mut(arn)
                .ok_or_else(|| EngineError::UnknownTask(arn.to_string()))?;
            if seq_num < entry.seq_num {
                return Err(EngineError::StalePayload {
                    arn: arn.to_string(),
                    seq_num,
                    applied: entry.seq_num,
                });
            }
            entry.seq_num = seq_num;
            entry.inbox.clone()
        };

        inbox
            .send(ManagerMessage::UpdateDesired {
                desired_status: desired,
                seq_num,
            })
            .await
            .map_err(|_| EngineError::ManagerGone(arn.to_string()))
    }

    fn spawn_manager(&self, managers: &mut HashMap<String, ManagerEntry>, task: Task) {
        let arn = task.arn.clone();
        let seq_num = task.seq_num;
        for container in &task.containers {
            if let Some(runtime_id) = &container.runtime_id {
                self.inner.containers.insert(
                    runtime_id.clone(),
                    (arn.clone(), container.spec.name.clone()),
                );
            }
        }

        let (inbox, inbox_rx) = mpsc::channel(self.inner.config.manager_queue_size.max(1));
        let (manager, snapshot) = TaskManager::new(
            task,
            Arc::clone(&self.inner.runtime),
            Arc::clone(&self.inner.provisioner),
            Arc::clone(&self.inner.config),
            inbox_rx,
            self.inner.events.clone(),
            self.inner.notices.clone(),
        );
        let handle = tokio::spawn(manager.run());

        managers.insert(
            arn,
            ManagerEntry {
                inbox,
                snapshot,
                handle: Some(handle),
                seq_num,
            },
        );
    }

    async fn on_notice(&self, notice: EngineNotice) {
        match notice {
            EngineNotice::ContainerCreated {
                task_arn,
                container_name,
                runtime_id,
            } => {
                debug!(
                    "Indexing runtime id {} for container {} of task {}",
                    runtime_id, container_name, task_arn
                );
                self.inner
                    .containers
                    .insert(runtime_id, (task_arn, container_name));
            }
            EngineNotice::TaskPurgeable { task_arn, seq_num } => {
                self.inner.managers.write().await.remove(&task_arn);
                self.inner
                    .containers
                    .retain(|_, (owner, _)| owner != &task_arn);
                self.inner
                    .purged
                    .insert(task_arn.clone(), (seq_num, Utc::now()));
                self.prune_purged();
                info!("Task {} removed from the engine", task_arn);
            }
        }
    }

    /// Sequence number a task was purged at, unless it is past retention
    fn purged_seq(&self, arn: &str) -> Option<u64> {
        let (seq_num, purged_at) = *self.inner.purged.get(arn)?.value();
        (!self.purge_expired(purged_at)).then_some(seq_num)
    }

    fn purge_expired(&self, purged_at: DateTime<Utc>) -> bool {
        let age = (Utc::now() - purged_at).to_std().unwrap_or_default();
        age >= self.inner.config.purged_retention()
    }

    /// Forget purged tasks older than the retention window
    pub fn prune_purged(&self) {
        let before = self.inner.purged.len();
        self.inner
            .purged
            .retain(|_, (_, purged_at)| !self.purge_expired(*purged_at));
        let pruned = before.saturating_sub(self.inner.purged.len());
        if pruned > 0 {
            debug!("Forgot {} purged task(s)", pruned);
        }
    }

    /// Purged tasks still within the retention window, ordered by arn
    pub fn purged_tasks(&self) -> Vec<PurgedTask> {
        let mut purged: Vec<PurgedTask> = self
            .inner
            .purged
            .iter()
            .filter(|e| !self.purge_expired(e.value().1))
            .map(|e| PurgedTask {
                arn: e.key().clone(),
                seq_num: e.value().0,
                purged_at: e.value().1,
            })
            .collect();
        purged.sort_by(|a, b| a.arn.cmp(&b.arn));
        purged
    }

    /// Follow the runtime event stream for the life of the engine. When the
    /// stream ends it is opened again after a backoff delay, and every
    /// indexed container is inspected to catch what happened in between.
    async fn watch_runtime_events(&self) {
        let policy = &self.inner.config.event_stream_retry;
        let mut failures = 0u32;
        let mut subscriptions = 0u64;

        loop {
            let mut runtime_events = self.inner.runtime.events();
            subscriptions += 1;
            if subscriptions > 1 {
                info!("Resubscribed to runtime events; re-inspecting containers");
                self.reinspect_containers().await;
            }

            while let Some(event) = runtime_events.next().await {
                failures = 0;
                self.handle_runtime_event(event).await;
            }

            failures = failures.saturating_add(1);
            let delay = policy.delay_for(failures);
            warn!("Runtime event stream ended; resubscribing in {:?}", delay);
            sleep(delay).await;
        }
    }

    /// Inspect every indexed container and hand the result to its manager.
    /// Managers only apply statuses that move forward.
    async fn reinspect_containers(&self) {
        let deadline = self.inner.config.inspect_timeout();
        let indexed: Vec<(String, (String, String))> = self
            .inner
            .containers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (runtime_id, (task_arn, container_name)) in indexed {
            let metadata =
                match timeout(deadline, self.inner.runtime.inspect_container(&runtime_id)).await {
                    Ok(Ok(metadata)) => Some(metadata),
                    Ok(Err(RuntimeError::NotFound(_))) => None,
                    Ok(Err(e)) => {
                        warn!("Failed to inspect container {}: {}", runtime_id, e);
                        continue;
                    }
                    Err(_) => {
                        warn!("Timed out inspecting container {}", runtime_id);
                        continue;
                    }
                };

            let message = ManagerMessage::Observed {
                container_name,
                metadata,
            };
            if let Err(e) = self.send_to(&task_arn, message).await {
                debug!("Dropping inspection result: {}", e);
            }
        }
    }

    async fn send_to(&self, task_arn: &str, message: ManagerMessage) -> Result<()> {
        let inbox = self
            .inner
            .managers
            .read()
            .await
            .get(task_arn)
            .map(|e| e.inbox.clone())
            .ok_or_else(|| EngineError::UnknownTask(task_arn.to_string()))?;
        inbox
            .send(message)
            .await
            .map_err(|_| EngineError::ManagerGone(task_arn.to_string()))
    }

    /// Route a runtime event to the manager owning the container
    pub async fn handle_runtime_event(&self, event: RuntimeEvent) {
        let owner = self
            .inner
            .containers
            .get(&event.runtime_id)
            .map(|e| e.value().clone());
        let Some((task_arn, container_name)) = owner else {
            trace!("Ignoring event for unmanaged container {}", event.runtime_id);
            return;
        };

        let message = ManagerMessage::Runtime {
            container_name,
            event,
        };
        if let Err(e) = self.send_to(&task_arn, message).await {
            debug!("Dropping runtime event: {}", e);
        }
    }

    /// Route a delivery outcome to the manager that produced the events
    pub async fn handle_delivery(&self, notice: DeliveryNotice) {
        let task_arn = notice.task_arn().to_string();
        if let Err(e) = self
            .send_to(&task_arn, ManagerMessage::Delivered(notice))
            .await
        {
            debug!("Dropping delivery notice: {}", e);
        }
    }

    pub async fn handle_attachment(
        &self,
        task_arn: &str,
        attachment_id: &str,
        status: AttachmentStatus,
    ) -> Result<()> {
        self.send_to(
            task_arn,
            ManagerMessage::Attachment {
                attachment_id: attachment_id.to_string(),
                status,
            },
        )
        .await
    }

    /// Ask every manager to re-emit its current statuses
    pub async fn resync(&self) {
        let inboxes: Vec<_> = self
            .inner
            .managers
            .read()
            .await
            .values()
            .map(|e| e.inbox.clone())
            .collect();
        info!("Resyncing {} task(s)", inboxes.len());
        for inbox in inboxes {
            let _ = inbox.send(ManagerMessage::Resync).await;
        }
    }

    pub async fn get_task_by_arn(&self, arn: &str) -> Option<Task> {
        self.inner
            .managers
            .read()
            .await
            .get(arn)
            .map(|e| e.snapshot.borrow().clone())
    }

    /// Snapshots of every managed task, ordered by arn
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .managers
            .read()
            .await
            .values()
            .map(|e| e.snapshot.borrow().clone())
            .collect();
        tasks.sort_by(|a, b| a.arn.cmp(&b.arn));
        tasks
    }

    pub async fn task_count(&self) -> usize {
        self.inner.managers.read().await.len()
    }

    /// Owning task arn and container name for a runtime id
    pub fn task_for_runtime_id(&self, runtime_id: &str) -> Option<(String, String)> {
        self.inner
            .containers
            .get(runtime_id)
            .map(|e| e.value().clone())
    }

    pub async fn snapshot(&self) -> Checkpoint {
        Checkpoint::new(self.list_tasks().await).with_purged(self.purged_tasks())
    }

    pub async fn save_to(&self, store: &CheckpointStore) -> Result<()> {
        let checkpoint = self.snapshot().await;
        store.save(&checkpoint).await?;
        Ok(())
    }

    /// Load the store's checkpoint (if any) and restore from it
    pub async fn restore_from(&self, store: &CheckpointStore) -> Result<usize> {
        match store.load().await? {
            Some(checkpoint) => Ok(self.restore(checkpoint).await),
            None => {
                info!("No checkpoint found in {}", store.directory().display());
                Ok(0)
            }
        }
    }

    /// Resume the tasks of a checkpoint, reconciling each container against
    /// what the runtime reports now. Returns the number of tasks resumed.
    pub async fn restore(&self, checkpoint: Checkpoint) -> usize {
        for purged in checkpoint.purged {
            if !self.purge_expired(purged.purged_at) {
                self.inner
                    .purged
                    .insert(purged.arn, (purged.seq_num, purged.purged_at));
            }
        }

        let mut restored = 0;
        for mut task in checkpoint.tasks {
            if self.inner.managers.read().await.contains_key(&task.arn) {
                warn!("Task {} is already managed; skipping its checkpoint", task.arn);
                continue;
            }
            self.reconcile_restored(&mut task).await;

            let mut managers = self.inner.managers.write().await;
            info!(
                "Restoring task {} (known {}, desired {})",
                task.arn, task.known_status, task.desired_status
            );
            self.spawn_manager(&mut managers, task);
            restored += 1;
        }
        info!("Restored {} task(s) from checkpoint", restored);
        restored
    }

    /// Move checkpointed statuses forward to what the runtime reports
    async fn reconcile_restored(&self, task: &mut Task) {
        let deadline = self.inner.config.inspect_timeout();

        for container in &mut task.containers {
            let Some(runtime_id) = container.runtime_id.clone() else {
                continue;
            };
            if container.known_status == ContainerStatus::Removed {
                continue;
            }

            match timeout(deadline, self.inner.runtime.inspect_container(&runtime_id)).await {
                Ok(Ok(metadata)) => {
                    if metadata.status > container.known_status {
                        info!(
                            "Container {} of task {} moved {} -> {} while the agent was away",
                            container.spec.name, task.arn, container.known_status, metadata.status
                        );
                        container.known_status = metadata.status;
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
                }
                Ok(Err(RuntimeError::NotFound(_))) => {
                    if container.known_status < ContainerStatus::Stopped {
                        warn!(
                            "Container {} of task {} no longer exists on the host",
                            container.spec.name, task.arn
                        );
                        container.known_status = ContainerStatus::Stopped;
                        container.finished_at.get_or_insert_with(Utc::now);
                        container
                            .reason
                            .get_or_insert_with(|| VANISHED_REASON.to_string());
                    }
                }
                Ok(Err(e)) => warn!(
                    "Failed to inspect container {} of task {}: {}; keeping checkpointed status",
                    container.spec.name, task.arn, e
                ),
                Err(_) => warn!(
                    "Timed out inspecting container {} of task {}; keeping checkpointed status",
                    container.spec.name, task.arn
                ),
            }

            if container.known_status.is_stopped()
                && container.desired_status < ContainerStatus::Stopped
            {
                container.desired_status = ContainerStatus::Stopped;
            }
        }

        let computed = task.computed_known_status();
        if computed > task.known_status {
            task.known_status = computed;
            task.known_status_changed_at = Utc::now();
            if computed == TaskStatus::Stopped {
                task.stopped_at.get_or_insert_with(Utc::now);
                if task.desired_status < TaskStatus::Stopped {
                    task.desired_status = TaskStatus::Stopped;
                }
            }
        }
    }

    /// Stop every manager and the routing loops. Task snapshots remain
    /// readable afterwards for a final checkpoint.
    pub async fn shutdown(&self) {
        let running: Vec<(String, mpsc::Sender<ManagerMessage>, Option<JoinHandle<()>>)> = self
            .inner
            .managers
            .write()
            .await
            .iter_mut()
            .map(|(arn, e)| (arn.clone(), e.inbox.clone(), e.handle.take()))
            .collect();

        info!("Stopping {} task manager(s)", running.len());
        for (_, inbox, _) in &running {
            let _ = inbox.send(ManagerMessage::Shutdown).await;
        }
        for (arn, _, handle) in running {
            let Some(mut handle) = handle else {
                continue;
            };
            if timeout(MANAGER_SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Task manager for {} did not stop in time; aborting it", arn);
                handle.abort();
            }
        }

        let loops = std::mem::take(
            &mut *self
                .inner
                .loops
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in loops {
            handle.abort();
        }
        debug!("Task engine stopped");
    }
}

use super::ReportingConfig;
use super::event::StateChangeEvent;
use super::pipeline::{Batch, EventPipeline};
use crate::channel::ControlPlaneChannel;
use crate::task::{AttachmentStatus, ContainerStatus, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Outcome of a batch, reported back to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryNotice {
    /// Control plane acknowledged these statuses
    Delivered {
        task_arn: String,
        task_status: Option<TaskStatus>,
        containers: Vec<(String, ContainerStatus)>,
        attachments: Vec<(String, AttachmentStatus)>,
    },
    /// Retry budget ran out; the next resync is the recovery path
    Abandoned { task_arn: String, token: String },
}

impl DeliveryNotice {
    pub fn task_arn(&self) -> &str {
        match self {
            DeliveryNotice::Delivered { task_arn, .. } => task_arn,
            DeliveryNotice::Abandoned { task_arn, .. } => task_arn,
        }
    }

    fn delivered(batch: &Batch) -> Self {
        let mut task_status = None;
        let mut containers = Vec::new();
        let mut attachments = Vec::new();
        for event in &batch.events {
            match event {
                StateChangeEvent::Task(e) => task_status = Some(e.status),
                StateChangeEvent::Container(e) => containers.push((e.container_name.clone(), e.status)),
                StateChangeEvent::Attachment(e) => {
                    attachments.push((e.attachment_id.clone(), e.status))
                }
            }
        }
        DeliveryNotice::Delivered {
            task_arn: batch.task_arn.clone(),
            task_status,
            containers,
            attachments,
        }
    }
}

#[derive(Debug)]
enum Control {
    Ack(String),
    Shutdown,
}

/// Where a task's outstanding batch stands
#[derive(Debug, Clone)]
enum Phase {
    AwaitingAck { token: String, deadline: Instant },
    Backoff { until: Instant },
}

impl Phase {
    fn due_at(&self) -> Instant {
        match self {
            Phase::AwaitingAck { deadline, .. } => *deadline,
            Phase::Backoff { until } => *until,
        }
    }
}

/// Cloneable handle feeding the sender loop
#[derive(Clone)]
pub struct StatusSenderHandle {
    events: mpsc::Sender<StateChangeEvent>,
    control: mpsc::UnboundedSender<Control>,
}

impl StatusSenderHandle {
    /// Queue an event for reporting. Returns false once the sender is gone.
    pub async fn publish(&self, event: StateChangeEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Raw event sender, for components that publish on their own
    pub fn event_sender(&self) -> mpsc::Sender<StateChangeEvent> {
        self.events.clone()
    }

    /// Forward an acknowledgement received from the control plane
    pub fn ack(&self, token: &str) {
        let _ = self.control.send(Control::Ack(token.to_string()));
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

/// Sends batched state changes upstream and reconciles acks.
///
/// Every batch is kept in flight until it is acked. A failed send or a
/// missing ack requeues the batch's events and parks the task for a backoff
/// delay, so newer events for the same entities replace the stale ones in
/// the retransmission. An unchanged retransmission reuses its token. Once
/// the retry budget is spent the batch is dropped with a warning and an
/// [`DeliveryNotice::Abandoned`] notice.
pub struct StatusSender {
    pipeline: EventPipeline,
    channel: Arc<dyn ControlPlaneChannel>,
    config: ReportingConfig,
    events: mpsc::Receiver<StateChangeEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    notices: mpsc::UnboundedSender<DeliveryNotice>,
    /// Keyed by task arn
    phases: HashMap<String, Phase>,
}

impl StatusSender {
    pub fn new(
        channel: Arc<dyn ControlPlaneChannel>,
        config: ReportingConfig,
        notices: mpsc::UnboundedSender<DeliveryNotice>,
    ) -> (Self, StatusSenderHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.queue_size.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let sender = Self {
            pipeline: EventPipeline::new(),
            channel,
            config,
            events: events_rx,
            control: control_rx,
            notices,
            phases: HashMap::new(),
        };
        let handle = StatusSenderHandle {
            events: events_tx,
            control: control_tx,
        };
        (sender, handle)
    }

    /// Spawn the sender loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Status sender started");
        loop {
            self.dispatch().await;

            let next_due = self.phases.values().map(|p| p.due_at()).min();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        debug!("Queued state change: {}", event);
                        self.pipeline.push(event);
                    }
                    None => break,
                },
                control = self.control.recv() => match control {
                    Some(Control::Ack(token)) => self.on_ack(&token),
                    Some(Control::Shutdown) | None => break,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.on_timers();
                }
            }
        }
        info!(
            "Status sender stopped ({} pending, {} in flight)",
            self.pipeline.pending_len(),
            self.pipeline.in_flight_len()
        );
    }

    /// Send every batch the pipeline has ready
    async fn dispatch(&mut self) {
        for batch in self.pipeline.take_ready() {
            self.transmit(&batch.token).await;
        }
    }

    async fn transmit(&mut self, token: &str) {
        let Some(batch) = self.pipeline.in_flight_mut(token) else {
            return;
        };
        batch.attempts += 1;
        let attempts = batch.attempts;
        let message = batch.to_message();
        let task_arn = batch.task_arn.clone();

        debug!(
            "Sending {} event(s) for task {} (token {}, attempt {})",
            batch.events.len(),
            task_arn,
            token,
            attempts
        );

        let result = timeout(self.config.send_timeout(), self.channel.send(message)).await;
        match result {
            Ok(Ok(())) => {
                self.phases.insert(
                    task_arn,
                    Phase::AwaitingAck {
                        token: token.to_string(),
                        deadline: Instant::now() + self.config.ack_timeout(),
                    },
                );
            }
            Ok(Err(e)) => {
                debug!("Send for task {} failed: {}", task_arn, e);
                self.retry_or_abandon(&task_arn, token, attempts);
            }
            Err(_) => {
                debug!("Send for task {} timed out", task_arn);
                self.retry_or_abandon(&task_arn, token, attempts);
            }
        }
    }

    fn retry_or_abandon(&mut self, task_arn: &str, token: &str, attempts: u32) {
        if self.config.retry.exhausted(attempts) {
            self.phases.remove(task_arn);
            if let Some(batch) = self.pipeline.abandon(token) {
                warn!(
                    "Giving up on delivering {} event(s) for task {} after {} attempts (token {})",
                    batch.events.len(),
                    batch.task_arn,
                    attempts,
                    token
                );
                let _ = self.notices.send(DeliveryNotice::Abandoned {
                    task_arn: batch.task_arn,
                    token: token.to_string(),
                });
            }
            return;
        }

        let delay = self.config.retry.delay_for(attempts);
        debug!("Retrying task {} (token {}) in {:?}", task_arn, token, delay);
        self.pipeline.requeue(token);
        self.phases.insert(
            task_arn.to_string(),
            Phase::Backoff {
                until: Instant::now() + delay,
            },
        );
    }

    fn on_ack(&mut self, token: &str) {
        match self.pipeline.complete(token) {
            Some(batch) => {
                debug!("Task {} state change acknowledged (token {})", batch.task_arn, token);
                self.phases.remove(&batch.task_arn);
                self.pipeline.release(&batch.task_arn);
                let _ = self.notices.send(DeliveryNotice::delivered(&batch));
            }
            None => debug!("Ignoring ack for unknown token {}", token),
        }
    }

    fn on_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<(String, Phase)> = self
            .phases
            .iter()
            .filter(|(_, phase)| phase.due_at() <= now)
            .map(|(task_arn, phase)| (task_arn.clone(), phase.clone()))
            .collect();

        for (task_arn, phase) in due {
            match phase {
                Phase::AwaitingAck { token, .. } => {
                    let attempts = self
                        .pipeline
                        .in_flight_mut(&token)
                        .map(|b| b.attempts)
                        .unwrap_or(0);
                    debug!("No ack for token {} yet", token);
                    self.retry_or_abandon(&task_arn, &token, attempts);
                }
                Phase::Backoff { .. } => {
                    self.phases.remove(&task_arn);
                    self.pipeline.release(&task_arn);
                }
            }
        }
    }
}

use super::event::StateChangeEvent;
use crate::channel::{AttachmentStateChange, OutboundMessage, TaskStateChange};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Events sent together as one outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Client-generated message token, reused on every retry
    pub token: String,
    pub task_arn: String,
    pub events: Vec<StateChangeEvent>,
    /// Transmissions so far
    pub attempts: u32,
}

impl Batch {
    fn new(task_arn: &str, events: Vec<StateChangeEvent>) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            task_arn: task_arn.to_string(),
            events,
            attempts: 0,
        }
    }

    /// Wire representation of the batch
    pub fn to_message(&self) -> OutboundMessage {
        let timestamp = self
            .events
            .iter()
            .map(StateChangeEvent::timestamp)
            .max()
            .unwrap_or_else(chrono::Utc::now);

        if let [StateChangeEvent::Attachment(event)] = self.events.as_slice() {
            return OutboundMessage::AttachmentStateChange(AttachmentStateChange {
                token: self.token.clone(),
                task_arn: self.task_arn.clone(),
                attachment_id: event.attachment_id.clone(),
                status: event.status,
                timestamp,
            });
        }

        let mut change = TaskStateChange {
            token: self.token.clone(),
            task_arn: self.task_arn.clone(),
            status: None,
            reason: None,
            containers: Vec::new(),
            timestamp,
        };
        for event in &self.events {
            match event {
                StateChangeEvent::Task(task) => {
                    change.status = Some(task.status);
                    change.reason = task.reason.clone();
                }
                StateChangeEvent::Container(container) => {
                    change.containers.push(container.to_change())
                }
                StateChangeEvent::Attachment(_) => {}
            }
        }
        OutboundMessage::TaskStateChange(change)
    }
}

/// Deduplicating, batching queue between task managers and the sender.
///
/// Pending events are kept per task in generation order. A new event for an
/// entity drops that entity's pending (never in-flight) event and joins the
/// back of the queue, so a superseding event is ordered after everything
/// generated before it. Each task has at most one batch in flight; its next
/// batch is cut only after the previous one is acked, abandoned or requeued.
///
/// A requeued batch goes back to the front of its task's queue, minus the
/// events a newer pending event supersedes. The task stays parked until
/// [`EventPipeline::release`]. If the next cut carries exactly the same
/// events it keeps the old token and attempt count.
#[derive(Debug, Default)]
pub struct EventPipeline {
    pending: HashMap<String, VecDeque<StateChangeEvent>>,
    /// Tasks with pending events, in first-arrival order
    order: VecDeque<String>,
    in_flight: HashMap<String, Batch>,
    /// Tasks waiting out a retry delay
    parked: HashSet<String>,
    /// Last failed batch per task
    requeued: HashMap<String, Batch>,
}

impl EventPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event, superseding any pending event for the same entity
    pub fn push(&mut self, event: StateChangeEvent) {
        let task_arn = event.task_arn().to_string();
        let key = event.key();
        let queue = self.pending.entry(task_arn.clone()).or_default();

        let before = queue.len();
        queue.retain(|pending| pending.key() != key);
        if queue.len() < before {
            debug!("Superseded pending event for {:?}", key);
        }
        queue.push_back(event);

        if !self.order.contains(&task_arn) {
            self.order.push_back(task_arn);
        }
    }

    /// Cut the next batch of every task that has nothing in flight.
    pub fn take_ready(&mut self) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut still_pending = VecDeque::new();

        while let Some(task_arn) = self.order.pop_front() {
            if self.in_flight.contains_key(&task_arn) || self.parked.contains(&task_arn) {
                still_pending.push_back(task_arn);
                continue;
            }
            let Some(queue) = self.pending.get_mut(&task_arn) else {
                continue;
            };

            let events = Self::cut(queue);
            if queue.is_empty() {
                self.pending.remove(&task_arn);
            } else {
                still_pending.push_back(task_arn.clone());
            }
            if events.is_empty() {
                continue;
            }

            let batch = match self.requeued.remove(&task_arn) {
                Some(previous) if previous.events == events => Batch { events, ..previous },
                Some(previous) if events.iter().any(|e| previous.events.contains(e)) => Batch {
                    attempts: previous.attempts,
                    ..Batch::new(&task_arn, events)
                },
                _ => Batch::new(&task_arn, events),
            };
            self.in_flight.insert(task_arn, batch.clone());
            batches.push(batch);
        }

        self.order = still_pending;
        batches
    }

    /// Front run of container events, closed by at most one task event.
    /// Attachment events always travel alone.
    fn cut(queue: &mut VecDeque<StateChangeEvent>) -> Vec<StateChangeEvent> {
        let mut events = Vec::new();

        if matches!(queue.front(), Some(StateChangeEvent::Attachment(_))) {
            events.extend(queue.pop_front());
            return events;
        }

        while let Some(front) = queue.front() {
            match front {
                StateChangeEvent::Container(_) => events.extend(queue.pop_front()),
                StateChangeEvent::Task(_) => {
                    events.extend(queue.pop_front());
                    break;
                }
                StateChangeEvent::Attachment(_) => break,
            }
        }
        events
    }

    /// Mutable access to the in-flight batch carrying `token`
    pub fn in_flight_mut(&mut self, token: &str) -> Option<&mut Batch> {
        self.in_flight.values_mut().find(|b| b.token == token)
    }

    /// Release the batch acknowledged by `token`. A late ack for a requeued
    /// batch also drops its events from the pending queue.
    pub fn complete(&mut self, token: &str) -> Option<Batch> {
        if let Some(batch) = self.remove_in_flight(token) {
            return Some(batch);
        }

        let task_arn = self
            .requeued
            .iter()
            .find(|(_, b)| b.token == token)
            .map(|(arn, _)| arn.clone())?;
        let batch = self.requeued.remove(&task_arn)?;
        if let Some(queue) = self.pending.get_mut(&task_arn) {
            queue.retain(|pending| !batch.events.contains(pending));
            if queue.is_empty() {
                self.pending.remove(&task_arn);
                self.order.retain(|arn| arn != &task_arn);
            }
        }
        Some(batch)
    }

    /// Give up on the in-flight batch carrying `token`
    pub fn abandon(&mut self, token: &str) -> Option<Batch> {
        let batch = self.remove_in_flight(token)?;
        self.requeued.remove(&batch.task_arn);
        self.parked.remove(&batch.task_arn);
        Some(batch)
    }

    /// Put a failed in-flight batch back in front of its task's queue and
    /// park the task. Returns the task arn.
    pub fn requeue(&mut self, token: &str) -> Option<String> {
        let batch = self.remove_in_flight(token)?;
        let task_arn = batch.task_arn.clone();

        let queue = self.pending.entry(task_arn.clone()).or_default();
        for event in batch.events.iter().rev() {
            if queue.iter().any(|pending| pending.key() == event.key()) {
                debug!("Dropping retried event for {:?}, superseded", event.key());
                continue;
            }
            queue.push_front(event.clone());
        }
        if !self.order.contains(&task_arn) {
            self.order.push_back(task_arn.clone());
        }

        self.parked.insert(task_arn.clone());
        self.requeued.insert(task_arn.clone(), batch);
        Some(task_arn)
    }

    /// Let a parked task cut batches again
    pub fn release(&mut self, task_arn: &str) {
        self.parked.remove(task_arn);
    }

    fn remove_in_flight(&mut self, token: &str) -> Option<Batch> {
        let task_arn = self
            .in_flight
            .iter()
            .find(|(_, b)| b.token == token)
            .map(|(arn, _)| arn.clone())?;
        let batch = self.in_flight.remove(&task_arn);
        if self.pending.contains_key(&task_arn) && !self.order.contains(&task_arn) {
            self.order.push_back(task_arn);
        }
        batch
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.parked.is_empty()
    }
}

use super::{
    ChannelError, ControlPlaneChannel, InboundMessage, OutboundMessage, Result, TaskStateChange,
};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};

#[derive(Default)]
struct RecordingState {
    messages: Vec<OutboundMessage>,
    fail_sends: u32,
    drop_acks: bool,
    ack_sink: Option<mpsc::Sender<InboundMessage>>,
}

/// In-memory control plane: records every outbound message and can answer
/// each one with an ack on an inbound queue.
#[derive(Default)]
pub struct RecordingChannel {
    state: Mutex<RecordingState>,
    sent: Notify,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every successfully sent message with an ack on `sink`. An ack
    /// that does not fit in the queue is lost, like one dropped in transit.
    pub fn ack_into(&self, sink: mpsc::Sender<InboundMessage>) {
        self.state().ack_sink = Some(sink);
    }

    /// Fail the next `times` sends
    pub fn fail_sends(&self, times: u32) {
        self.state().fail_sends = times;
    }

    /// Stop (or resume) acknowledging messages
    pub fn set_drop_acks(&self, drop: bool) {
        self.state().drop_acks = drop;
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.state().messages.clone()
    }

    /// Task state change reports sent so far
    pub fn task_changes(&self) -> Vec<TaskStateChange> {
        self.state()
            .messages
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::TaskStateChange(change) => Some(change.clone()),
                OutboundMessage::AttachmentStateChange(_) => None,
            })
            .collect()
    }

    /// Wait until at least `count` messages have been recorded
    pub async fn wait_for_messages(&self, count: usize) {
        loop {
            let notified = self.sent.notified();
            if self.state().messages.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ControlPlaneChannel for RecordingChannel {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        {
            let mut state = self.state();
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(ChannelError::SendFailed("injected failure".to_string()));
            }

            let token = message.token().to_string();
            state.messages.push(message);
            if !state.drop_acks {
                if let Some(sink) = &state.ack_sink {
                    let _ = sink.try_send(InboundMessage::Ack { token });
                }
            }
        }
        self.sent.notify_waiters();
        Ok(())
    }
}

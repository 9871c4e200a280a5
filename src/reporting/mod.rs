//! State change reporting.
//!
//! Task managers publish [`StateChangeEvent`]s through a
//! [`StatusSenderHandle`]. The [`StatusSender`] loop feeds them into the
//! [`EventPipeline`] (dedup per entity, batching per task, one batch in
//! flight per task), sends batches over the control-plane channel, retries
//! with backoff and matches acks by message token. Delivery outcomes flow
//! back to the engine as [`DeliveryNotice`]s.

pub mod event;
pub mod pipeline;
pub mod sender;

#[cfg(test)]
mod tests;

pub use event::*;
pub use pipeline::{Batch, EventPipeline};
pub use sender::{DeliveryNotice, StatusSender, StatusSenderHandle};

use crate::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Status reporting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// How long to wait for an ack before retransmitting, in milliseconds
    pub ack_timeout_ms: u64,
    /// Deadline for handing one message to the transport, in milliseconds
    pub send_timeout_ms: u64,
    /// Capacity of the ingress queue shared by all task managers
    pub queue_size: usize,
    /// Retransmission policy
    pub retry: BackoffPolicy,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
            queue_size: 1_024,
            retry: BackoffPolicy::status_delivery(),
        }
    }
}

impl ReportingConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

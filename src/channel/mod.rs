//! Control-plane channel.
//!
//! The agent pushes state change reports through [`ControlPlaneChannel`] and
//! receives [`InboundMessage`]s (desired state, acks, resync requests) on an
//! mpsc queue fed by the transport. [`stdio`] carries newline-delimited JSON
//! over stdin/stdout; [`recording`] keeps everything in memory for tests.

pub mod messages;
pub mod recording;
pub mod stdio;

pub use messages::*;
pub use recording::RecordingChannel;
pub use stdio::{LineChannel, StdioChannel, read_inbound};

use async_trait::async_trait;

/// Control-plane transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport is not connected
    #[error("Channel disconnected")]
    Disconnected,

    /// Message could not be delivered
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Outbound side of the control-plane connection.
#[async_trait]
pub trait ControlPlaneChannel: Send + Sync {
    /// Hand a message to the transport. Success means it was written, not
    /// that it was acknowledged.
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

use super::{ChannelError, ControlPlaneChannel, InboundMessage, OutboundMessage, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Writes one JSON document per line to any async writer.
pub struct LineChannel<W> {
    writer: Mutex<W>,
}

/// Line channel over the process's stdout
pub type StdioChannel = LineChannel<tokio::io::Stdout>;

impl StdioChannel {
    pub fn stdout() -> Self {
        LineChannel::new(tokio::io::stdout())
    }
}

impl<W> LineChannel<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> ControlPlaneChannel for LineChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        debug!("Sent message {} for task {}", message.token(), message.task_arn());
        Ok(())
    }
}

/// Read newline-delimited inbound messages until EOF, forwarding each one
/// to `tx`. Lines that fail to parse, including ones that are not valid
/// UTF-8, are logged and skipped.
///
/// # Errors
///
/// Returns [`ChannelError::Io`] on read failure and
/// [`ChannelError::Disconnected`] if the receiving side is gone.
pub async fn read_inbound<R>(mut reader: R, tx: mpsc::Sender<InboundMessage>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.trim_ascii().is_empty() {
            continue;
        }

        match serde_json::from_slice::<InboundMessage>(line.trim_ascii()) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return Err(ChannelError::Disconnected);
                }
            }
            Err(e) => warn!("Ignoring malformed inbound message: {}", e),
        }
    }

    debug!("Inbound stream reached EOF");
    Ok(())
}

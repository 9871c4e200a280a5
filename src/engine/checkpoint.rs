//! Engine state persistence.
//!
//! A checkpoint is the full task index serialized as JSON. Saves are atomic:
//! the data goes to a temporary file which is synced and then renamed over
//! the previous checkpoint, so a crash mid-write leaves the old one intact.

use crate::env;
use crate::task::Task;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Checkpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Seconds between periodic saves
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(env::DEFAULT_STATE_DIR),
            interval_secs: 30,
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(1))
    }
}

/// A task that already left the engine, remembered so late payloads for it
/// are not registered again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgedTask {
    pub arn: String,
    pub seq_num: u64,
    pub purged_at: DateTime<Utc>,
}

/// Snapshot of every task the engine manages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub purged: Vec<PurgedTask>,
}

impl Checkpoint {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            version: env::checkpoint::FORMAT_VERSION,
            saved_at: Utc::now(),
            tasks,
            purged: Vec::new(),
        }
    }

    pub fn with_purged(mut self, purged: Vec<PurgedTask>) -> Self {
        self.purged = purged;
        self
    }

    pub fn is_compatible(&self) -> bool {
        self.version == env::checkpoint::FORMAT_VERSION
    }
}

/// Reads and writes checkpoints in a state directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path(&self) -> PathBuf {
        env::checkpoint_file_path(&self.directory)
    }

    /// Write the checkpoint atomically
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        async_fs::create_dir_all(&self.directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create checkpoint directory: {}",
                    self.directory.display()
                )
            })?;

        let data =
            serde_json::to_vec_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        let temp_path = env::checkpoint_temp_file_path(&self.directory);
        let final_path = self.path();

        let mut file = async_fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(&data)
            .await
            .context("Failed to write checkpoint data")?;
        file.sync_all()
            .await
            .context("Failed to sync checkpoint file")?;
        drop(file);

        async_fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move checkpoint into {}", final_path.display()))?;

        debug!(
            "Checkpoint saved: {} task(s), {} bytes",
            checkpoint.tasks.len(),
            data.len()
        );
        Ok(())
    }

    /// Load the last checkpoint, if there is one
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let path = self.path();
        if !async_fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = async_fs::read(&path)
            .await
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&content).context("Failed to deserialize checkpoint")?;

        if !checkpoint.is_compatible() {
            warn!(
                "Checkpoint version {} differs from {}; attempting to use it anyway",
                checkpoint.version,
                env::checkpoint::FORMAT_VERSION
            );
        }
        info!(
            "Loaded checkpoint from {} with {} task(s) saved at {}",
            path.display(),
            checkpoint.tasks.len(),
            checkpoint.saved_at
        );
        Ok(Some(checkpoint))
    }

    /// Delete the checkpoint file
    pub async fn clear(&self) -> Result<()> {
        let path = self.path();
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

//! # Top-level agent wiring
//!
//! [`Agent`] ties the subsystems together:
//!
//! ```text
//! inbound ──► Agent ──► TaskEngine ──► TaskManager (one per task) ──► RuntimeClient
//!                            │                 │
//!                            │                 └── StateChangeEvent ──► StatusSender ──► channel
//!                            └◄──────────── DeliveryNotice ◄─────────────────┘
//! ```
//!
//! It dispatches control-plane messages, runs the periodic checkpointer and
//! shuts everything down in order: managers first, then a final checkpoint,
//! then the status sender.
//!
//! ## Example
//!
//! ```rust,no_run
//! use node_agent::{Agent, AgentConfig, MockRuntime, RecordingChannel};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let runtime = Arc::new(MockRuntime::new());
//! let channel = Arc::new(RecordingChannel::new());
//! let agent = Agent::start(AgentConfig::default(), runtime, channel).await?;
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::channel::{ControlPlaneChannel, InboundMessage};
use crate::engine::{
    self, CheckpointConfig, CheckpointStore, EngineConfig, EngineError, TaskEngine,
};
use crate::reporting::{ReportingConfig, StatusSender, StatusSenderHandle};
use crate::runtime::{ResourceProvisioner, RuntimeClient, RuntimeConfig, RuntimeProvisioner};
use crate::task::TaskSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

const SENDER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Unified configuration for every subsystem of the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub engine: EngineConfig,
    pub reporting: ReportingConfig,
    pub checkpoint: CheckpointConfig,
    pub runtime: RuntimeConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string. Missing sections and fields
    /// keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A running node agent
pub struct Agent {
    config: AgentConfig,
    engine: TaskEngine,
    sender: StatusSenderHandle,
    store: Option<CheckpointStore>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    /// Delivery-notice forwarder and checkpointer
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Start an agent whose task resources are volumes on `runtime`
    pub async fn start(
        config: AgentConfig,
        runtime: Arc<dyn RuntimeClient>,
        channel: Arc<dyn ControlPlaneChannel>,
    ) -> engine::Result<Self> {
        let provisioner = Arc::new(RuntimeProvisioner::new(runtime.clone()));
        Self::start_with(config, runtime, provisioner, channel).await
    }

    /// Start an agent, restoring the last checkpoint when checkpointing is
    /// enabled.
    pub async fn start_with(
        config: AgentConfig,
        runtime: Arc<dyn RuntimeClient>,
        provisioner: Arc<dyn ResourceProvisioner>,
        channel: Arc<dyn ControlPlaneChannel>,
    ) -> engine::Result<Self> {
        info!("Starting node agent");

        let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
        let (status_sender, sender) =
            StatusSender::new(channel, config.reporting.clone(), notices_tx);
        let sender_task = status_sender.spawn();

        let engine = TaskEngine::new(
            runtime,
            provisioner,
            config.engine.clone(),
            sender.event_sender(),
        );
        engine.start();

        let store = config
            .checkpoint
            .enabled
            .then(|| CheckpointStore::new(&config.checkpoint.directory));

        if let Some(store) = &store {
            match engine.restore_from(store).await {
                Ok(count) => info!("Restored {} task(s) from checkpoint", count),
                Err(e) => {
                    engine.shutdown().await;
                    sender.shutdown();
                    sender_task.abort();
                    return Err(e);
                }
            }
        }

        let mut background = Vec::new();

        let forwarder = engine.clone();
        background.push(tokio::spawn(async move {
            while let Some(notice) = notices_rx.recv().await {
                forwarder.handle_delivery(notice).await;
            }
            debug!("Delivery notice stream closed");
        }));

        if let Some(store) = &store {
            background.push(Self::spawn_checkpointer(
                engine.clone(),
                store.clone(),
                config.checkpoint.interval(),
            ));
        }

        info!("Node agent started");
        Ok(Self {
            config,
            engine,
            sender,
            store,
            sender_task: Mutex::new(Some(sender_task)),
            background: Mutex::new(background),
        })
    }

    fn spawn_checkpointer(
        engine: TaskEngine,
        store: CheckpointStore,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.prune_purged();
                if let Err(e) = engine.save_to(&store).await {
                    warn!("Periodic checkpoint failed: {}", e);
                }
            }
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn checkpoint_store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    /// Apply a desired-state payload as if it came from the control plane
    pub async fn submit(&self, tasks: Vec<TaskSpec>, seq_num: u64) {
        self.handle_inbound(InboundMessage::TaskPayload { tasks, seq_num })
            .await;
    }

    /// Dispatch one control-plane message
    pub async fn handle_inbound(&self, message: InboundMessage) {
        match message {
            InboundMessage::TaskPayload { tasks, seq_num } => {
                debug!("Task payload seq {} with {} task(s)", seq_num, tasks.len());
                for spec in tasks {
                    match self.engine.handle_payload(spec, seq_num).await {
                        Ok(()) => {}
                        Err(e @ EngineError::StalePayload { .. }) => debug!("{}", e),
                        Err(e) => warn!("{}", e),
                    }
                }
            }
            InboundMessage::Ack { token } => self.sender.ack(&token),
            InboundMessage::Heartbeat => debug!("Heartbeat from control plane"),
            InboundMessage::RefreshCredentials { task_arn } => {
                if self.engine.get_task_by_arn(&task_arn).await.is_some() {
                    info!("Credentials refreshed for task {}", task_arn);
                } else {
                    debug!("Credentials refresh for unknown task {}", task_arn);
                }
            }
            InboundMessage::AttachmentUpdate {
                task_arn,
                attachment_id,
                status,
            } => {
                if let Err(e) = self
                    .engine
                    .handle_attachment(&task_arn, &attachment_id, status)
                    .await
                {
                    debug!("Dropping attachment update for {}: {}", attachment_id, e);
                }
            }
            InboundMessage::Resync => {
                info!("Resync requested by control plane");
                self.engine.resync().await;
            }
        }
    }

    /// Dispatch inbound messages until the queue closes
    pub async fn serve(&self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle_inbound(message).await;
        }
        info!("Control-plane input closed");
    }

    /// Stop every task manager, write a final checkpoint and stop reporting.
    /// Containers keep running; a later start resumes them from the
    /// checkpoint.
    pub async fn shutdown(&self) {
        info!("Shutting down node agent...");

        let background =
            std::mem::take(&mut *self.background.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in background {
            handle.abort();
        }

        self.engine.shutdown().await;

        if let Some(store) = &self.store {
            match self.engine.save_to(store).await {
                Ok(()) => info!("Final checkpoint written to {}", store.path().display()),
                Err(e) => warn!("Final checkpoint failed: {}", e),
            }
        }

        self.sender.shutdown();
        let sender_task = self
            .sender_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = sender_task {
            if timeout(SENDER_SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Status sender did not stop in time; aborting it");
                handle.abort();
            }
        }

        info!("Node agent shutdown complete");
    }
}

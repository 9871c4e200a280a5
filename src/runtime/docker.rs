//! Docker/Podman runtime backed by the bollard API.
//!
//! Translates [`CreateContainerRequest`]s into bollard create configs and
//! the daemon's event stream into [`RuntimeEvent`]s.

use super::{
    ContainerMetadata, CreateContainerRequest, Result, RuntimeClient, RuntimeConfig, RuntimeError,
    RuntimeEvent, RuntimeEventKind, VolumeRequest,
};
use crate::task::{ContainerStatus, HealthStatus, NetworkBinding};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EventMessage, EventMessageTypeEnum,
    HealthConfig, HealthStatusEnum,
};
use bollard::service::{HostConfig, PortBinding};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NANOS_PER_SEC: i64 = 1_000_000_000;

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 400,
                message,
            } => RuntimeError::InvalidConfig(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api(format!("{}: {}", status_code, message)),
            other => RuntimeError::Unavailable(other.to_string()),
        }
    }
}

/// Runtime client talking to a Docker-compatible daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect using the configured endpoint, or the local defaults when none
    /// is set, and verify the daemon answers.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] if the daemon cannot be reached.
    pub async fn connect(config: &RuntimeConfig) -> Result<Self> {
        let docker = match config.docker_host.as_deref() {
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                debug!("Connecting to container runtime over HTTP: {}", host);
                Docker::connect_with_http(
                    host,
                    config.connect_timeout_secs,
                    bollard::API_DEFAULT_VERSION,
                )
            }
            Some(host) => {
                debug!("Connecting to container runtime socket: {}", host);
                Docker::connect_with_socket(
                    host,
                    config.connect_timeout_secs,
                    bollard::API_DEFAULT_VERSION,
                )
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Unavailable(format!("Failed to connect: {}", e)))?;

        let runtime = Self {
            docker: Arc::new(docker),
        };
        runtime.ping().await?;
        info!("Connected to container runtime");
        Ok(runtime)
    }

    /// Wrap an already configured bollard client.
    pub fn with_docker(docker: Docker) -> Self {
        Self {
            docker: Arc::new(docker),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::Unavailable(format!("Failed to ping container runtime: {}", e))
        })?;
        debug!("Container runtime ping successful");
        Ok(())
    }

    fn create_config(request: &CreateContainerRequest) -> bollard::container::Config<String> {
        let binds: Vec<String> = request
            .binds
            .iter()
            .map(|b| {
                if b.read_only {
                    format!("{}:{}:ro", b.volume, b.container_path)
                } else {
                    format!("{}:{}", b.volume, b.container_path)
                }
            })
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &request.ports {
            port_bindings.insert(
                format!("{}/{}", port.container_port, port.protocol),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: port.host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            volumes_from: if request.volumes_from.is_empty() {
                None
            } else {
                Some(request.volumes_from.clone())
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            memory: request.memory_mib.map(|mib| (mib * 1024 * 1024) as i64),
            cpu_shares: request.cpu_shares.map(i64::from),
            ..Default::default()
        };

        let healthcheck = request.health_check.as_ref().map(|check| {
            let test = match check.command.first().map(String::as_str) {
                Some("CMD") | Some("CMD-SHELL") | Some("NONE") => check.command.clone(),
                _ => std::iter::once("CMD".to_string())
                    .chain(check.command.iter().cloned())
                    .collect(),
            };
            HealthConfig {
                test: Some(test),
                interval: Some(check.interval_secs as i64 * NANOS_PER_SEC),
                timeout: Some(check.timeout_secs as i64 * NANOS_PER_SEC),
                retries: Some(i64::from(check.retries)),
                start_period: Some(check.start_period_secs as i64 * NANOS_PER_SEC),
                ..Default::default()
            }
        });

        bollard::container::Config {
            image: Some(request.image.clone()),
            cmd: if request.command.is_empty() {
                None
            } else {
                Some(request.command.clone())
            },
            env: Some(
                request
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(
                request
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            healthcheck,
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);
        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::PullFailed {
                        image: image.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<ContainerMetadata> {
        let options = bollard::container::CreateContainerOptions {
            name: request.name.as_str(),
            ..Default::default()
        };

        debug!("Creating container: {}", request.name);
        let response = self
            .docker
            .create_container(Some(options), Self::create_config(request))
            .await?;

        info!("Created container: {} ({})", request.name, response.id);
        self.inspect_container(&response.id).await
    }

    async fn start_container(&self, runtime_id: &str) -> Result<ContainerMetadata> {
        debug!("Starting container: {}", runtime_id);
        self.docker
            .start_container(
                runtime_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await?;

        info!("Started container: {}", runtime_id);
        self.inspect_container(runtime_id).await
    }

    async fn stop_container(
        &self,
        runtime_id: &str,
        timeout: Duration,
    ) -> Result<ContainerMetadata> {
        debug!("Stopping container: {}", runtime_id);
        let result = self
            .docker
            .stop_container(
                runtime_id,
                Some(bollard::container::StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await;

        match result {
            Ok(()) => info!("Stopped container: {}", runtime_id),
            // already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("Container {} was already stopped", runtime_id),
            Err(e) => return Err(e.into()),
        }

        self.inspect_container(runtime_id).await
    }

    async fn remove_container(&self, runtime_id: &str) -> Result<()> {
        debug!("Removing container: {}", runtime_id);
        self.docker
            .remove_container(
                runtime_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;

        info!("Removed container: {}", runtime_id);
        Ok(())
    }

    async fn inspect_container(&self, runtime_id: &str) -> Result<ContainerMetadata> {
        let inspect = self
            .docker
            .inspect_container(
                runtime_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await?;

        Ok(metadata_from_inspect(runtime_id, inspect))
    }

    async fn create_volume(&self, request: &VolumeRequest) -> Result<()> {
        debug!("Creating volume: {}", request.name);

        let driver_opts: HashMap<&str, &str> = request
            .driver_opts
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let labels: HashMap<&str, &str> = request
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let response = self
            .docker
            .create_volume(bollard::volume::CreateVolumeOptions {
                name: request.name.as_str(),
                driver: request.driver.as_str(),
                driver_opts,
                labels,
            })
            .await?;

        info!("Created volume: {}", response.name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        debug!("Removing volume: {}", name);
        self.docker
            .remove_volume(name, Some(bollard::volume::RemoveVolumeOptions { force: true }))
            .await?;

        info!("Removed volume: {}", name);
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, RuntimeEvent> {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let mut stream = docker.events(None::<bollard::query_parameters::EventsOptions>);
            while let Some(message) = stream.next().await {
                match message {
                    Ok(message) => {
                        let Some(event) = translate_event(message) else {
                            continue;
                        };
                        if tx.unbounded_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Container runtime event stream failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Container runtime event stream closed");
        });

        rx.boxed()
    }
}

fn metadata_from_inspect(runtime_id: &str, inspect: ContainerInspectResponse) -> ContainerMetadata {
    let runtime_id = inspect.id.clone().unwrap_or_else(|| runtime_id.to_string());
    let mut metadata = ContainerMetadata::new(&runtime_id, ContainerStatus::Created);

    if let Some(state) = inspect.state {
        metadata.status = match state.status {
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::PAUSED)
            | Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED)
            | Some(ContainerStateStatusEnum::DEAD)
            | Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Stopped,
            _ => ContainerStatus::Created,
        };
        if metadata.status == ContainerStatus::Stopped {
            metadata.exit_code = state.exit_code.map(|code| code as i32);
        }
        metadata.started_at = state.started_at.as_deref().and_then(parse_docker_time);
        metadata.finished_at = state.finished_at.as_deref().and_then(parse_docker_time);
        metadata.oom_killed = state.oom_killed.unwrap_or(false);
        metadata.health = match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        };
    }

    if let Some(ports) = inspect.network_settings.and_then(|n| n.ports) {
        for (key, bindings) in ports {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let Ok(container_port) = port.parse::<u16>() else {
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                let Some(host_port) = binding.host_port.and_then(|p| p.parse::<u16>().ok()) else {
                    continue;
                };
                metadata.network_bindings.push(NetworkBinding {
                    bind_ip: binding.host_ip.unwrap_or_default(),
                    container_port,
                    host_port,
                    protocol: protocol.to_string(),
                });
            }
        }
    }

    metadata
}

/// Docker reports unset times as the zero time (`0001-01-01T00:00:00Z`)
fn parse_docker_time(value: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc);
    if parsed.timestamp() <= 0 {
        None
    } else {
        Some(parsed)
    }
}

fn translate_event(message: EventMessage) -> Option<RuntimeEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let actor = message.actor?;
    let runtime_id = actor.id?;
    let action = message.action?;
    let attributes = actor.attributes.unwrap_or_default();

    let kind = match action.as_str() {
        "start" => RuntimeEventKind::Started,
        "die" => RuntimeEventKind::Died {
            exit_code: attributes.get("exitCode").and_then(|c| c.parse().ok()),
        },
        "oom" => RuntimeEventKind::Oom,
        other => {
            let status = other.strip_prefix("health_status")?;
            match status.trim_start_matches(':').trim() {
                "healthy" => RuntimeEventKind::Health(HealthStatus::Healthy),
                "unhealthy" => RuntimeEventKind::Health(HealthStatus::Unhealthy),
                _ => return None,
            }
        }
    };

    let observed_at = message
        .time
        .and_then(|t| DateTime::from_timestamp(t, 0))
        .unwrap_or_else(Utc::now);

    Some(RuntimeEvent {
        runtime_id,
        kind,
        observed_at,
    })
}

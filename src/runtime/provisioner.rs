use super::{Result, RuntimeClient, RuntimeError, VolumeRequest};
use crate::env;
use crate::task::{ResourceKind, ResourceSpec};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates and releases task resources.
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Bring a resource to CREATED
    async fn provision(&self, task_arn: &str, resource: &ResourceSpec) -> Result<()>;

    /// Tear a resource down. Releasing something already gone succeeds.
    async fn release(&self, task_arn: &str, resource: &ResourceSpec) -> Result<()>;
}

/// Provisioner backed by the container runtime.
///
/// Volumes are created in the runtime. Secrets and credentials are fetched
/// by their own providers before the payload reaches the agent, so they are
/// accepted as already materialised.
pub struct RuntimeProvisioner {
    runtime: Arc<dyn RuntimeClient>,
}

impl RuntimeProvisioner {
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ResourceProvisioner for RuntimeProvisioner {
    async fn provision(&self, task_arn: &str, resource: &ResourceSpec) -> Result<()> {
        match &resource.kind {
            ResourceKind::Volume {
                driver,
                driver_opts,
            } => {
                let mut labels = BTreeMap::new();
                labels.insert(env::runtime::LABEL_TASK_ARN.to_string(), task_arn.to_string());
                labels.insert(env::runtime::LABEL_MANAGED.to_string(), "true".to_string());

                let request = VolumeRequest {
                    name: resource.runtime_name(task_arn),
                    driver: driver.clone(),
                    driver_opts: driver_opts.clone(),
                    labels,
                };
                self.runtime.create_volume(&request).await?;
                info!("Provisioned volume {} for task {}", request.name, task_arn);
            }
            ResourceKind::Secret { source } => {
                debug!("Secret {} for task {} resolved from {}", resource.name, task_arn, source);
            }
            ResourceKind::Credentials { credentials_id } => {
                debug!(
                    "Credentials {} for task {} registered as {}",
                    resource.name, task_arn, credentials_id
                );
            }
        }
        Ok(())
    }

    async fn release(&self, task_arn: &str, resource: &ResourceSpec) -> Result<()> {
        if let ResourceKind::Volume { .. } = resource.kind {
            let name = resource.runtime_name(task_arn);
            match self.runtime.remove_volume(&name).await {
                Ok(()) => info!("Released volume {} for task {}", name, task_arn),
                Err(RuntimeError::NotFound(_)) => {
                    debug!("Volume {} already gone", name)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

//! ---
//! cpilot_section: "06-orchestration"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Stage orchestration for control resources, environments and jobs."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use cpilot_cloud::{CreateRequest, ResourceBackend, ResourceGoal, ResourceHandle, ResourcePoll};
use cpilot_common::config::{ControlConfig, PollingConfig};
use cpilot_common::manifest::{keys, RunManifest};
use cpilot_common::{LifecycleError, Result};
use cpilot_controlplane::{with_warmup, ControlPlane};

use crate::short_suffix;

/// Names of control parameters with dedicated handling.
const PARAM_DB_READ: &str = "db_read_capacity";
const PARAM_DB_WRITE: &str = "db_write_capacity";

/// What the create-control stage hands to later stages.
#[derive(Debug, Clone)]
pub struct ControlResources {
    pub name: String,
    pub dns: String,
}

/// Provisions and tears down the control resource through a cloud backend,
/// then brings the control plane on it to a usable state.
pub struct ControlResourceLifecycle {
    backend: Arc<dyn ResourceBackend>,
    control: Arc<dyn ControlPlane>,
    cloud: String,
    config: ControlConfig,
    environment_base: String,
    polling: PollingConfig,
}

impl ControlResourceLifecycle {
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        control: Arc<dyn ControlPlane>,
        cloud: impl Into<String>,
        config: ControlConfig,
        environment_base: impl Into<String>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            backend,
            control,
            cloud: cloud.into(),
            config,
            environment_base: environment_base.into(),
            polling,
        }
    }

    /// Resource names carry a fresh 4-character suffix per run so repeated
    /// runs never collide. Stack-style clouds get a longer marker; instance
    /// names have tighter length limits.
    fn resource_name(&self) -> String {
        if let Some(name) = &self.config.name {
            return name.clone();
        }
        match self.cloud.as_str() {
            "gcp" => format!("{}-{}", self.environment_base, short_suffix()),
            _ => format!("{}ControlResources-{}", self.environment_base, short_suffix()),
        }
    }

    /// Create the control resource and wait for the control plane on it to
    /// come up: provision, discover the public address, resolve the real
    /// domain name, log in and wait for storage to be generated.
    pub async fn create(&self, manifest: &mut RunManifest) -> Result<ControlResources> {
        let name = self.resource_name();
        info!(resource = %name, cloud = %self.cloud, "creating control resources");
        manifest.record(keys::CONTROL_RESOURCES, &name)?;

        let request = CreateRequest {
            template_path: self.config.template_path.clone(),
            parameters: self.config.parameters.clone(),
        };
        let handle = self.backend.create(&name, &request).await?;
        self.await_goal(&handle, ResourceGoal::Creation).await?;

        let ip = self.backend.output_value(&handle, "InstanceIP").await?;
        info!(%ip, "control resources are up");

        let warmup = self.polling.warmup_policy();
        let control = Arc::clone(&self.control);
        let dns = with_warmup(warmup, "control domain discovery", || {
            let control = Arc::clone(&control);
            let ip = ip.clone();
            async move { control.control_domain(&ip).await }
        })
        .await?;
        self.control.set_endpoint(&dns);
        manifest.record(keys::CONTROL_DNS, &dns)?;
        info!(%dns, "control plane endpoint resolved");

        let control = Arc::clone(&self.control);
        with_warmup(warmup, "control plane login", || {
            let control = Arc::clone(&control);
            async move { control.login().await }
        })
        .await?;

        let control = Arc::clone(&self.control);
        with_warmup(warmup, "storage readiness", || {
            let control = Arc::clone(&control);
            async move { control.storage_ready().await }
        })
        .await?;

        if let (Some(read), Some(write)) = (
            self.config.parameters.get(PARAM_DB_READ),
            self.config.parameters.get(PARAM_DB_WRITE),
        ) {
            self.control.set_db_throughput(read, write).await?;
            info!(%read, %write, "database throughput adjusted");
        }

        info!(resource = %name, %dns, "control resources ready");
        Ok(ControlResources { name, dns })
    }

    /// Delete a control resource by the name the manifest recorded for it.
    pub async fn delete(&self, name: &str) -> Result<()> {
        info!(resource = %name, "deleting control resources");
        let handle = ResourceHandle::new(name);
        self.backend.delete(&handle).await?;
        self.await_goal(&handle, ResourceGoal::Deletion).await?;
        info!(resource = %name, "control resources deleted");
        Ok(())
    }

    async fn await_goal(&self, handle: &ResourceHandle, goal: ResourceGoal) -> Result<()> {
        let policy = self.polling.resource_policy();
        let operation = match goal {
            ResourceGoal::Creation => "control resource creation",
            ResourceGoal::Deletion => "control resource deletion",
        };
        let mut waited = Duration::ZERO;
        loop {
            match self.backend.poll(handle, goal).await? {
                ResourcePoll::Satisfied => return Ok(()),
                ResourcePoll::Gone => {
                    return match goal {
                        ResourceGoal::Deletion => Ok(()),
                        ResourceGoal::Creation => Err(LifecycleError::provider(
                            "MISSING",
                            format!("{} disappeared while being created", handle.id),
                        )),
                    }
                }
                ResourcePoll::Failed { status, reason } => {
                    return Err(LifecycleError::provider(status, reason))
                }
                ResourcePoll::Pending { status } => {
                    if policy.expired(waited) {
                        return Err(LifecycleError::timeout(operation, waited));
                    }
                    info!(resource = %handle.id, %status, "still waiting on the provider");
                    tokio::time::sleep(policy.interval).await;
                    waited += policy.interval;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockControl;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    struct ScriptedBackend {
        polls: Mutex<VecDeque<ResourcePoll>>,
        deleted: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(polls: Vec<ResourcePoll>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResourceBackend for ScriptedBackend {
        async fn create(&self, name: &str, _request: &CreateRequest) -> Result<ResourceHandle> {
            Ok(ResourceHandle::new(name))
        }

        async fn delete(&self, handle: &ResourceHandle) -> Result<()> {
            self.deleted.lock().push(handle.id.clone());
            Ok(())
        }

        async fn poll(&self, _handle: &ResourceHandle, _goal: ResourceGoal) -> Result<ResourcePoll> {
            Ok(self
                .polls
                .lock()
                .pop_front()
                .unwrap_or(ResourcePoll::Satisfied))
        }

        async fn output_value(&self, _handle: &ResourceHandle, key: &str) -> Result<String> {
            assert_eq!(key, "InstanceIP");
            Ok("198.51.100.7".to_owned())
        }
    }

    fn fast_polling() -> PollingConfig {
        PollingConfig {
            resource_interval: Duration::from_millis(1),
            resource_max_wait: Duration::from_millis(50),
            warmup_interval: Duration::from_millis(1),
            warmup_max_wait: Duration::from_millis(50),
            ..PollingConfig::default()
        }
    }

    fn lifecycle(backend: ScriptedBackend, cloud: &str) -> ControlResourceLifecycle {
        ControlResourceLifecycle::new(
            Arc::new(backend),
            Arc::new(MockControl::new()),
            cloud,
            ControlConfig::default(),
            "bio-sim",
            fast_polling(),
        )
    }

    #[tokio::test]
    async fn create_provisions_and_readies_the_control_plane() {
        let backend = ScriptedBackend::new(vec![
            ResourcePoll::Pending {
                status: "CREATE_IN_PROGRESS".to_owned(),
            },
            ResourcePoll::Satisfied,
        ]);
        let lifecycle = lifecycle(backend, "aws");

        let dir = tempdir().unwrap();
        let mut manifest = RunManifest::reset(&dir.path().join("run.manifest")).unwrap();
        let resources = lifecycle.create(&mut manifest).await.unwrap();

        assert!(resources.name.starts_with("bio-simControlResources-"));
        assert_eq!(resources.dns, "ctl.example.net");
    }

    #[tokio::test]
    async fn provider_failure_stops_creation() {
        let backend = ScriptedBackend::new(vec![ResourcePoll::Failed {
            status: "ROLLBACK_COMPLETE".to_owned(),
            reason: "instance quota exceeded".to_owned(),
        }]);
        let lifecycle = lifecycle(backend, "aws");

        let dir = tempdir().unwrap();
        let mut manifest = RunManifest::reset(&dir.path().join("run.manifest")).unwrap();
        let err = lifecycle.create(&mut manifest).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Provider { .. }));
    }

    #[tokio::test]
    async fn stuck_creation_times_out() {
        let polls = std::iter::repeat(ResourcePoll::Pending {
            status: "CREATE_IN_PROGRESS".to_owned(),
        })
        .take(512)
        .collect();
        let lifecycle = lifecycle(ScriptedBackend::new(polls), "aws");

        let dir = tempdir().unwrap();
        let mut manifest = RunManifest::reset(&dir.path().join("run.manifest")).unwrap();
        let err = lifecycle.create(&mut manifest).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { .. }));
    }

    #[tokio::test]
    async fn deletion_accepts_a_vanished_resource() {
        let backend = ScriptedBackend::new(vec![
            ResourcePoll::Pending {
                status: "DELETE_IN_PROGRESS".to_owned(),
            },
            ResourcePoll::Gone,
        ]);
        let lifecycle = lifecycle(backend, "aws");
        lifecycle.delete("bio-simControlResources-a1b2").await.unwrap();
    }

    #[test]
    fn gcp_resource_names_skip_the_stack_marker() {
        let lifecycle = lifecycle(ScriptedBackend::new(vec![]), "gcp");
        let name = lifecycle.resource_name();
        assert!(name.starts_with("bio-sim-"));
        assert!(!name.contains("ControlResources"));
    }
}

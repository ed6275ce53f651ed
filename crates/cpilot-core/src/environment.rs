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

use serde_json::Value;
use tracing::{info, warn};

use cpilot_common::config::{EnvironmentConfig, PollingConfig};
use cpilot_common::manifest::{keys, RunManifest};
use cpilot_common::{LifecycleError, Result};
use cpilot_controlplane::{with_warmup, ControlPlane, TerminateAck};

use crate::short_suffix;

/// Turns the environment configuration into the cluster descriptor the
/// control plane stores and spins up.
pub trait ClusterDescriptorBuilder: Send + Sync {
    fn build(&self, name: &str, config: &EnvironmentConfig) -> Result<Value>;
}

/// Builds descriptors from a JSON template file, overriding the cluster name
/// and splicing in configured parameters.
pub struct TemplateDescriptorBuilder;

impl ClusterDescriptorBuilder for TemplateDescriptorBuilder {
    fn build(&self, name: &str, config: &EnvironmentConfig) -> Result<Value> {
        let path = config.template_path.as_ref().ok_or_else(|| {
            LifecycleError::validation(
                "creating an environment requires [environment] template_path",
            )
        })?;
        let raw = std::fs::read_to_string(path)?;
        let mut descriptor: Value = serde_json::from_str(&raw).map_err(|err| {
            LifecycleError::validation(format!(
                "{} is not a valid cluster template: {err}",
                path.display()
            ))
        })?;

        let table = descriptor.as_object_mut().ok_or_else(|| {
            LifecycleError::validation(format!(
                "{} must contain a top-level object",
                path.display()
            ))
        })?;
        table.insert("clusterName".to_owned(), Value::String(name.to_owned()));
        for (key, value) in &config.parameters {
            table.insert(key.clone(), Value::String(value.clone()));
        }
        Ok(descriptor)
    }
}

/// Spins environments up and tears them down through the control plane.
pub struct EnvironmentLifecycle {
    control: Arc<dyn ControlPlane>,
    builder: Arc<dyn ClusterDescriptorBuilder>,
    polling: PollingConfig,
}

impl EnvironmentLifecycle {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        builder: Arc<dyn ClusterDescriptorBuilder>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            control,
            builder,
            polling,
        }
    }

    /// Create an environment and wait for it to finish spinning up.
    ///
    /// The configured name gets a fresh 4-character suffix; the suffixed
    /// name is what every later stage must use.
    pub async fn create(
        &self,
        config: &EnvironmentConfig,
        manifest: &mut RunManifest,
    ) -> Result<String> {
        let name = format!("{}-{}", config.name, short_suffix());
        info!(environment = %name, "creating environment");

        self.control.ensure_session().await?;
        let descriptor = self.builder.build(&name, config)?;

        let warmup = self.polling.warmup_policy();
        let control = Arc::clone(&self.control);
        with_warmup(warmup, "environment save", || {
            let control = Arc::clone(&control);
            let name = name.clone();
            let descriptor = descriptor.clone();
            async move { control.save_cluster(&name, &descriptor).await }
        })
        .await?;

        let control = Arc::clone(&self.control);
        with_warmup(warmup, "environment start", || {
            let control = Arc::clone(&control);
            let descriptor = descriptor.clone();
            async move { control.start_cluster(&descriptor).await }
        })
        .await?;

        manifest.record(keys::ENVIRONMENT_NAME, &name)?;
        self.monitor_creation(&name).await?;
        info!(environment = %name, "environment is up");
        Ok(name)
    }

    /// Poll the control plane until the environment reports spun up. Calling
    /// this against an environment that already finished is harmless: the
    /// first poll sees it up and returns.
    ///
    /// Transient transport failures are tolerated here: nodes join and leave
    /// the control plane's backing store while the cluster assembles, and a
    /// dropped poll is indistinguishable from that churn.
    pub async fn monitor_creation(&self, name: &str) -> Result<()> {
        let policy = self.polling.environment_policy();
        let mut waited = Duration::ZERO;
        loop {
            match self.control.spinning_cluster(name).await {
                Ok(status) => {
                    if let Some(error) = status.error {
                        return Err(LifecycleError::provider("SPIN_FAILED", error));
                    }
                    if status.spun_up {
                        return Ok(());
                    }
                    info!(environment = %name, "environment still spinning up");
                }
                Err(err) if err.is_transient() => {
                    warn!(environment = %name, "spin-up poll failed, will retry: {err}");
                }
                Err(err) => return Err(err),
            }
            if policy.expired(waited) {
                return Err(LifecycleError::timeout("environment spin-up", waited));
            }
            tokio::time::sleep(policy.interval).await;
            waited += policy.interval;
        }
    }

    /// Delete an environment and wait for its record to disappear.
    pub async fn delete(&self, name: &str) -> Result<()> {
        info!(environment = %name, "deleting environment");
        self.control.ensure_session().await?;

        let descriptor = match self.control.cluster_by_name(name).await? {
            Some(descriptor) => descriptor,
            None => {
                info!(environment = %name, "environment is already gone");
                return Ok(());
            }
        };

        match self.control.terminate_cluster(&descriptor).await? {
            TerminateAck::Completed => info!(environment = %name, "terminate finished inline"),
            TerminateAck::Started => info!(environment = %name, "terminate started"),
        }

        let policy = self.polling.environment_policy();
        let mut waited = Duration::ZERO;
        loop {
            match self.control.cluster_by_name(name).await {
                Ok(None) => {
                    info!(environment = %name, "environment deleted");
                    return Ok(());
                }
                Ok(Some(_)) => {
                    info!(environment = %name, "environment still terminating");
                }
                Err(err) if err.is_transient() => {
                    warn!(environment = %name, "termination poll failed, will retry: {err}");
                }
                Err(err) => return Err(err),
            }
            if policy.expired(waited) {
                return Err(LifecycleError::timeout("environment termination", waited));
            }
            tokio::time::sleep(policy.interval).await;
            waited += policy.interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockControl;
    use cpilot_controlplane::SpinStatus;
    use serde_json::json;
    use tempfile::tempdir;

    struct FixedBuilder;

    impl ClusterDescriptorBuilder for FixedBuilder {
        fn build(&self, name: &str, _config: &EnvironmentConfig) -> Result<Value> {
            Ok(json!({"clusterName": name, "schedulers": ["econ1"]}))
        }
    }

    fn fast_polling() -> PollingConfig {
        PollingConfig {
            environment_interval: Duration::from_millis(1),
            environment_max_wait: Duration::from_millis(50),
            warmup_interval: Duration::from_millis(1),
            warmup_max_wait: Duration::from_millis(50),
            ..PollingConfig::default()
        }
    }

    fn lifecycle(control: Arc<MockControl>) -> EnvironmentLifecycle {
        EnvironmentLifecycle::new(control, Arc::new(FixedBuilder), fast_polling())
    }

    #[tokio::test]
    async fn create_saves_starts_and_waits_for_spin_up() {
        let control = Arc::new(MockControl::new());
        control.push_spin(Ok(SpinStatus {
            spun_up: false,
            error: None,
        }));
        control.push_spin(Ok(SpinStatus {
            spun_up: true,
            error: None,
        }));

        let dir = tempdir().unwrap();
        let mut manifest = RunManifest::reset(&dir.path().join("run.manifest")).unwrap();
        let name = lifecycle(control.clone())
            .create(&EnvironmentConfig::default(), &mut manifest)
            .await
            .unwrap();

        assert!(name.starts_with("hpc-env-"));
        let saved = control.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, name);
        assert_eq!(control.started.lock().len(), 1);
    }

    #[tokio::test]
    async fn spin_errors_fail_the_stage() {
        let control = Arc::new(MockControl::new());
        control.push_spin(Ok(SpinStatus {
            spun_up: false,
            error: Some("scheduler node failed to start".to_owned()),
        }));

        let dir = tempdir().unwrap();
        let mut manifest = RunManifest::reset(&dir.path().join("run.manifest")).unwrap();
        let err = lifecycle(control)
            .create(&EnvironmentConfig::default(), &mut manifest)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Provider { .. }));
    }

    #[tokio::test]
    async fn transient_spin_poll_failures_are_tolerated() {
        let control = Arc::new(MockControl::new());
        control.push_spin(Err(LifecycleError::transport("connection reset")));
        control.push_spin(Ok(SpinStatus {
            spun_up: true,
            error: None,
        }));

        let dir = tempdir().unwrap();
        let mut manifest = RunManifest::reset(&dir.path().join("run.manifest")).unwrap();
        lifecycle(control)
            .create(&EnvironmentConfig::default(), &mut manifest)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn monitoring_an_already_running_environment_returns_at_once() {
        // No spin statuses are queued, so every poll reports spun up.
        let control = Arc::new(MockControl::new());
        let lifecycle = lifecycle(control);

        lifecycle.monitor_creation("bio-sim-a1b2").await.unwrap();
        lifecycle.monitor_creation("bio-sim-a1b2").await.unwrap();
    }

    #[tokio::test]
    async fn delete_waits_for_the_record_to_vanish() {
        let control = Arc::new(MockControl::new());
        control.push_record(Some(json!({"clusterName": "bio-sim-a1b2"})));
        control.push_record(Some(json!({"clusterName": "bio-sim-a1b2"})));
        control.push_record(None);

        lifecycle(control.clone()).delete("bio-sim-a1b2").await.unwrap();
        assert_eq!(control.terminated.lock().len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_missing_environment_is_a_no_op() {
        let control = Arc::new(MockControl::new());
        control.push_record(None);

        lifecycle(control.clone()).delete("bio-sim-a1b2").await.unwrap();
        assert!(control.terminated.lock().is_empty());
    }

    #[test]
    fn template_builder_overrides_name_and_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, r#"{"clusterName": "stale", "instanceType": "c5.large"}"#)
            .unwrap();

        let mut config = EnvironmentConfig {
            template_path: Some(path),
            ..EnvironmentConfig::default()
        };
        config
            .parameters
            .insert("instanceType".to_owned(), "c5.xlarge".to_owned());

        let descriptor = TemplateDescriptorBuilder
            .build("bio-sim-a1b2", &config)
            .unwrap();
        assert_eq!(descriptor["clusterName"], "bio-sim-a1b2");
        assert_eq!(descriptor["instanceType"], "c5.xlarge");
    }

    #[test]
    fn template_builder_requires_a_template() {
        let err = TemplateDescriptorBuilder
            .build("bio-sim-a1b2", &EnvironmentConfig::default())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation { .. }));
    }
}

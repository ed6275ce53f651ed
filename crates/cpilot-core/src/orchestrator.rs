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

use indexmap::IndexMap;
use tracing::{info, warn};

use cpilot_cloud::{backend_for, ProviderSettings, ResourceBackend};
use cpilot_common::config::AppConfig;
use cpilot_common::manifest::{keys, ManifestView, RunManifest};
use cpilot_common::{LifecycleError, Result};
use cpilot_controlplane::{ControlPlane, HttpControlPlane};
use cpilot_jobs::{
    run_to_completion, ssh_factory, JobDescriptor, JobKind, JobLifecycle, TransportFactory,
    Workflow,
};

use crate::control::ControlResourceLifecycle;
use crate::environment::{ClusterDescriptorBuilder, EnvironmentLifecycle, TemplateDescriptorBuilder};
use crate::stages::Stage;

/// Runs the requested stages in order against one set of collaborators,
/// stopping at the first stage that fails.
pub struct Orchestrator {
    config: AppConfig,
    control: Arc<dyn ControlPlane>,
    control_resources: ControlResourceLifecycle,
    environment: EnvironmentLifecycle,
    jobs: JobLifecycle,
    workflows: IndexMap<String, Arc<dyn Workflow>>,
}

impl Orchestrator {
    /// Wire the orchestrator from configuration with the shipped backends.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let settings = ProviderSettings {
            region: config.control.region.clone(),
            project: config.control.parameters.get("project").cloned(),
            zone: config.control.zone.clone(),
        };
        let backend = backend_for(&config.general.cloud, &settings)?;
        let control: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
            config.user.name.clone(),
            config.user.password.clone(),
        )?);
        let transports = ssh_factory(&config.user.name, config.user.ssh_key_path.clone());
        Ok(Self::new(
            config,
            control,
            backend,
            Arc::new(TemplateDescriptorBuilder),
            transports,
        ))
    }

    /// Wire the orchestrator from explicit collaborators.
    pub fn new(
        config: AppConfig,
        control: Arc<dyn ControlPlane>,
        backend: Arc<dyn ResourceBackend>,
        builder: Arc<dyn ClusterDescriptorBuilder>,
        transports: TransportFactory,
    ) -> Self {
        let control_resources = ControlResourceLifecycle::new(
            backend,
            Arc::clone(&control),
            config.general.cloud.clone(),
            config.control.clone(),
            config.environment.name.clone(),
            config.polling.clone(),
        );
        let environment = EnvironmentLifecycle::new(
            Arc::clone(&control),
            builder,
            config.polling.clone(),
        );
        let jobs = JobLifecycle::new(
            Arc::clone(&control),
            transports,
            config.user.name.clone(),
            config.user.password.clone(),
            config.polling.clone(),
        );
        Self {
            config,
            control,
            control_resources,
            environment,
            jobs,
            workflows: IndexMap::new(),
        }
    }

    /// Register a workflow implementation under its reported name; entries
    /// with `kind = "workflow"` select it through their `type` option.
    pub fn register_workflow(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.name().to_owned(), workflow);
    }

    /// Execute the planned stages in order.
    ///
    /// A fresh create-control run truncates the manifest; every other plan
    /// appends to it and seeds missing state (environment name, control
    /// endpoint) from previous runs' records.
    pub async fn run(&self, stages: &[Stage]) -> Result<()> {
        let manifest_path = self.config.general.manifest_path.clone();
        let starts_fresh = stages.contains(&Stage::CreateControl);

        let view = if starts_fresh {
            ManifestView::default()
        } else {
            ManifestView::load(&manifest_path).unwrap_or_default()
        };
        // Opened on first write so read-only plans leave no file behind.
        let mut manifest = if starts_fresh {
            Some(RunManifest::reset(&manifest_path)?)
        } else {
            None
        };

        let mut environment_name = view
            .get(keys::ENVIRONMENT_NAME)
            .map(str::to_owned)
            .unwrap_or_else(|| self.config.environment.name.clone());
        let mut control_name = self
            .config
            .control
            .name
            .clone()
            .or_else(|| view.get(keys::CONTROL_RESOURCES).map(str::to_owned));

        if !starts_fresh && self.control.endpoint().is_none() {
            // A configured (or flag-supplied) endpoint wins over the manifest.
            let dns = self
                .config
                .control
                .dns
                .as_deref()
                .or_else(|| view.get(keys::CONTROL_DNS));
            if let Some(dns) = dns {
                self.control.set_endpoint(dns);
            }
        }

        for stage in stages {
            info!(%stage, "starting stage");
            match stage {
                Stage::CreateControl => {
                    let mut writer = match manifest.take() {
                        Some(writer) => writer,
                        None => RunManifest::open(&manifest_path)?,
                    };
                    let resources = self.control_resources.create(&mut writer).await?;
                    manifest = Some(writer);
                    control_name = Some(resources.name);
                }
                Stage::CreateEnvironment => {
                    let mut writer = match manifest.take() {
                        Some(writer) => writer,
                        None => RunManifest::open(&manifest_path)?,
                    };
                    environment_name = self
                        .environment
                        .create(&self.config.environment, &mut writer)
                        .await?;
                    manifest = Some(writer);
                }
                Stage::RunJobs => {
                    self.run_jobs(&environment_name).await?;
                }
                Stage::DeleteEnvironment => {
                    self.environment.delete(&environment_name).await?;
                }
                Stage::DeleteControl => {
                    let name = control_name.as_deref().ok_or_else(|| {
                        LifecycleError::validation(
                            "no control resource name is known; configure [control] name \
                             or run from a manifest that records one",
                        )
                    })?;
                    self.control_resources.delete(name).await?;
                }
                Stage::DeleteFromManifest => {
                    self.delete_from_manifest().await?;
                }
            }
            info!(%stage, "stage finished");
        }
        Ok(())
    }

    /// Run every configured job script against the environment.
    ///
    /// Monitored jobs run one after another to completion; jobs flagged
    /// `monitor_job = false` are submitted as they are encountered and
    /// watched together once everything has been submitted.
    async fn run_jobs(&self, environment: &str) -> Result<()> {
        if !environment.contains('-') {
            return Err(LifecycleError::validation(format!(
                "'{environment}' is not a full environment name; jobs need the suffixed \
                 name (like {environment}-a1b2) from the create stage or the manifest",
            )));
        }
        if self.config.jobs.scripts.is_empty() {
            return Err(LifecycleError::validation(
                "the run-jobs stage needs at least one entry under [jobs.scripts]",
            ));
        }

        let session = self.jobs.open_session(environment).await?;
        let mut batch = Vec::new();
        let mut failed_workflows = Vec::new();
        for (name, options) in &self.config.jobs.scripts {
            if JobKind::from_options(name, options)? == JobKind::Workflow {
                let workflow = self.workflow_for(name, options)?;
                if let Err(err) = run_to_completion(workflow.as_ref()).await {
                    warn!(workflow = %name, "workflow failed: {err}");
                    failed_workflows.push(name.clone());
                }
                continue;
            }

            let mut descriptor =
                JobDescriptor::from_options(name, options, &self.config.user.name)?;
            if options.get("scheduler").is_none() {
                descriptor.scheduler = self.config.general.scheduler.clone();
            }

            if descriptor.monitor_job {
                let outcome = self.jobs.process(&session, &descriptor).await?;
                info!(
                    job = %outcome.job,
                    job_id = %outcome.job_id,
                    scheduler = %outcome.scheduler_name,
                    "job ran to completion"
                );
            } else {
                batch.push(self.jobs.submit_job(&session, &descriptor).await?);
            }
        }

        if !batch.is_empty() {
            let report = self.jobs.monitor_batch(&session, batch).await?;
            if !report.all_completed() {
                return Err(LifecycleError::job(
                    report.failed.join(", "),
                    "batch jobs ended in failure",
                ));
            }
        }

        if !failed_workflows.is_empty() {
            return Err(LifecycleError::job(
                failed_workflows.join(", "),
                "workflows ended in failure",
            ));
        }
        Ok(())
    }

    /// Resolve a workflow entry's `type` option against the registry.
    fn workflow_for(&self, name: &str, options: &serde_json::Value) -> Result<&Arc<dyn Workflow>> {
        let kind = options
            .get("type")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                LifecycleError::job(name, "workflow entries need a type option naming the workflow")
            })?;
        self.workflows.get(kind).ok_or_else(|| {
            LifecycleError::validation(format!(
                "unknown workflow type '{}', registered: {}",
                kind,
                self.workflows
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    /// Tear down whatever a previous run's manifest recorded, skipping
    /// anything the run never got far enough to create.
    async fn delete_from_manifest(&self) -> Result<()> {
        let path = &self.config.general.manifest_path;
        if !path.exists() {
            info!(manifest = %path.display(), "no run manifest exists, nothing to delete");
            return Ok(());
        }
        let view = ManifestView::load(path)?;
        if view.is_empty() {
            info!(manifest = %path.display(), "manifest records nothing to delete");
            return Ok(());
        }

        if let Some(dns) = view.get(keys::CONTROL_DNS) {
            self.control.set_endpoint(dns);
        }

        match view.get(keys::ENVIRONMENT_NAME) {
            Some(environment) => self.environment.delete(environment).await?,
            None => info!("no environment was recorded, skipping"),
        }

        match view.get(keys::CONTROL_RESOURCES) {
            Some(name) => self.control_resources.delete(name).await?,
            None => info!("no control resources were recorded, skipping"),
        }
        Ok(())
    }
}

//! ---
//! cpilot_section: "02-cloud-backends"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Cloud resource backends for control resource provisioning."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use cpilot_common::{LifecycleError, Result};

pub mod cli;
pub mod instance;
pub mod stack;

pub use instance::{InstanceApi, InstanceBackend, OperationProbe};
pub use stack::{StackApi, StackBackend, StackProbe};

/// Cloud discriminators with a compiled-in backend.
pub const KNOWN_CLOUDS: &[&str] = &["aws", "gcp"];

/// Opaque reference to a provisioned control resource.
///
/// For stack-style clouds the id is the stack identifier returned at
/// creation; for instance-style clouds it is the instance name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub id: String,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Which terminal condition a poll is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceGoal {
    Creation,
    Deletion,
}

/// Classified outcome of a single status probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePoll {
    /// The goal state has been reached.
    Satisfied,
    /// Still in flight; poll again after the interval.
    Pending { status: String },
    /// The provider reported a terminal failure.
    Failed { status: String, reason: String },
    /// The resource no longer exists. Success when deleting.
    Gone,
}

/// Inputs to a control resource creation.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub template_path: Option<PathBuf>,
    pub parameters: IndexMap<String, String>,
}

/// Capability interface over one cloud's control resource operations.
///
/// Implementations classify raw provider statuses into [`ResourcePoll`];
/// the bounded waiting loop itself lives with the lifecycle that owns the
/// timeout, not here.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Start creating the resource and return a handle for later polls.
    async fn create(&self, name: &str, request: &CreateRequest) -> Result<ResourceHandle>;

    /// Request deletion. Completion is observed through [`Self::poll`].
    async fn delete(&self, handle: &ResourceHandle) -> Result<()>;

    /// Probe current status and classify it against the goal.
    async fn poll(&self, handle: &ResourceHandle, goal: ResourceGoal) -> Result<ResourcePoll>;

    /// Fetch a named output of the finished resource (e.g. its public IP).
    async fn output_value(&self, handle: &ResourceHandle, key: &str) -> Result<String>;
}

impl std::fmt::Debug for dyn ResourceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ResourceBackend")
    }
}

/// Connection settings shared by the shipped provider plumbing.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub region: String,
    pub project: Option<String>,
    pub zone: Option<String>,
}

/// Resolve a cloud discriminator to its backend.
///
/// Discriminators are matched against the compiled-in set; an unknown value
/// is a configuration mistake and is rejected up front rather than at the
/// first provider call.
pub fn backend_for(cloud: &str, settings: &ProviderSettings) -> Result<Arc<dyn ResourceBackend>> {
    match cloud {
        "aws" => Ok(Arc::new(StackBackend::new(Arc::new(
            cli::AwsCliStackApi::new(settings.region.clone()),
        )))),
        "gcp" => {
            let project = settings.project.clone().ok_or_else(|| {
                LifecycleError::validation("gcp backend requires a project id")
            })?;
            let zone = settings.zone.clone().ok_or_else(|| {
                LifecycleError::validation("gcp backend requires a zone")
            })?;
            Ok(Arc::new(InstanceBackend::new(Arc::new(
                cli::GcloudInstanceApi::new(project, zone),
            ))))
        }
        other => Err(LifecycleError::validation(format!(
            "unknown cloud '{}', expected one of: {}",
            other,
            KNOWN_CLOUDS.join(", ")
        ))),
    }
}

//! ---
//! cpilot_section: "02-cloud-backends"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Cloud resource backends for control resource provisioning."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, info};

use cpilot_common::{LifecycleError, Result};

use crate::{CreateRequest, ResourceBackend, ResourceGoal, ResourceHandle, ResourcePoll};

/// Raw status probe for a stack of resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackProbe {
    /// Latest stack-level event, with the provider's failure reason if any.
    Status { status: String, reason: String },
    /// The stack does not exist (any more).
    Missing,
}

/// Low-level stack operations, implemented by the provider plumbing.
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Create a stack from a template body, returning the stack id.
    async fn create_stack(
        &self,
        name: &str,
        template_body: &str,
        parameters: &IndexMap<String, String>,
    ) -> Result<String>;

    async fn delete_stack(&self, id: &str) -> Result<()>;

    /// Latest stack-level status event.
    async fn probe(&self, id: &str) -> Result<StackProbe>;

    /// Declared output value of a finished stack.
    async fn output(&self, id: &str, key: &str) -> Result<Option<String>>;
}

/// Backend for clouds that provision control resources as a template stack.
pub struct StackBackend {
    api: Arc<dyn StackApi>,
}

impl StackBackend {
    pub fn new(api: Arc<dyn StackApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ResourceBackend for StackBackend {
    async fn create(&self, name: &str, request: &CreateRequest) -> Result<ResourceHandle> {
        let template_path = request.template_path.as_ref().ok_or_else(|| {
            LifecycleError::validation("stack creation requires a template path")
        })?;
        let body = tokio::fs::read_to_string(template_path)
            .await
            .map_err(|err| {
                LifecycleError::validation(format!(
                    "unable to read template {}: {err}",
                    template_path.display()
                ))
            })?;

        let id = self
            .api
            .create_stack(name, &body, &request.parameters)
            .await?;
        info!(stack = %name, id = %id, "stack creation started");
        Ok(ResourceHandle::new(id))
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<()> {
        info!(id = %handle.id, "requesting stack deletion");
        self.api.delete_stack(&handle.id).await
    }

    async fn poll(&self, handle: &ResourceHandle, goal: ResourceGoal) -> Result<ResourcePoll> {
        let probe = self.api.probe(&handle.id).await?;
        debug!(id = %handle.id, ?goal, ?probe, "stack probe");
        Ok(classify(probe, goal))
    }

    async fn output_value(&self, handle: &ResourceHandle, key: &str) -> Result<String> {
        match self.api.output(&handle.id, key).await? {
            Some(value) => Ok(value),
            None => Err(LifecycleError::validation(format!(
                "stack {} declares no output '{}'",
                handle.id, key
            ))),
        }
    }
}

fn classify(probe: StackProbe, goal: ResourceGoal) -> ResourcePoll {
    match (goal, probe) {
        (ResourceGoal::Creation, StackProbe::Status { status, reason }) => match status.as_str() {
            "CREATE_COMPLETE" => ResourcePoll::Satisfied,
            "ROLLBACK_COMPLETE" | "ROLLBACK_FAILED" | "CREATE_FAILED" => {
                ResourcePoll::Failed { status, reason }
            }
            _ => ResourcePoll::Pending { status },
        },
        // A stack that vanishes mid-creation never emitted a terminal event.
        (ResourceGoal::Creation, StackProbe::Missing) => ResourcePoll::Failed {
            status: "MISSING".to_owned(),
            reason: "stack disappeared before reaching a terminal creation state".to_owned(),
        },
        (ResourceGoal::Deletion, StackProbe::Status { status, reason }) => match status.as_str() {
            "DELETE_COMPLETE" => ResourcePoll::Satisfied,
            "DELETE_FAILED" => ResourcePoll::Failed { status, reason },
            _ => ResourcePoll::Pending { status },
        },
        (ResourceGoal::Deletion, StackProbe::Missing) => ResourcePoll::Gone,
    }
}

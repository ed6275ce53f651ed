//! ---
//! cpilot_section: "02-cloud-backends"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Cloud resource backends for control resource provisioning."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use cpilot_common::{LifecycleError, Result};

use crate::{CreateRequest, ResourceBackend, ResourceGoal, ResourceHandle, ResourcePoll};

/// Raw status of an asynchronous provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationProbe {
    Done { error: Option<String> },
    Running,
}

/// Low-level instance operations, implemented by the provider plumbing.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Launch the control instance, returning the provider operation id.
    async fn start_instance(&self, name: &str, request: &CreateRequest) -> Result<String>;

    /// Request instance teardown, returning the provider operation id.
    async fn delete_instance(&self, name: &str) -> Result<String>;

    /// Status of a previously returned operation.
    async fn operation(&self, operation: &str) -> Result<OperationProbe>;

    async fn instance_exists(&self, name: &str) -> Result<bool>;

    /// Public address of a running instance, if one is attached.
    async fn instance_ip(&self, name: &str) -> Result<Option<String>>;
}

/// Backend for clouds that provision the control resource as a single
/// instance tracked through zone operations.
pub struct InstanceBackend {
    api: Arc<dyn InstanceApi>,
    // Operation ids are only valid within this process; recovered handles
    // fall back to existence checks.
    operations: Mutex<HashMap<String, String>>,
}

impl InstanceBackend {
    pub fn new(api: Arc<dyn InstanceApi>) -> Self {
        Self {
            api,
            operations: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, name: &str, operation: String) {
        self.operations.lock().insert(name.to_owned(), operation);
    }

    fn operation_for(&self, name: &str) -> Option<String> {
        self.operations.lock().get(name).cloned()
    }
}

#[async_trait]
impl ResourceBackend for InstanceBackend {
    async fn create(&self, name: &str, request: &CreateRequest) -> Result<ResourceHandle> {
        let operation = self.api.start_instance(name, request).await?;
        info!(instance = %name, operation = %operation, "instance creation started");
        self.remember(name, operation);
        Ok(ResourceHandle::new(name))
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<()> {
        let operation = self.api.delete_instance(&handle.id).await?;
        info!(instance = %handle.id, operation = %operation, "instance deletion started");
        self.remember(&handle.id, operation);
        Ok(())
    }

    async fn poll(&self, handle: &ResourceHandle, goal: ResourceGoal) -> Result<ResourcePoll> {
        if let Some(operation) = self.operation_for(&handle.id) {
            let probe = self.api.operation(&operation).await?;
            debug!(instance = %handle.id, ?goal, ?probe, "operation probe");
            return Ok(match probe {
                OperationProbe::Running => ResourcePoll::Pending {
                    status: "RUNNING".to_owned(),
                },
                OperationProbe::Done { error: None } => ResourcePoll::Satisfied,
                OperationProbe::Done { error: Some(reason) } => ResourcePoll::Failed {
                    status: "DONE".to_owned(),
                    reason,
                },
            });
        }

        match goal {
            ResourceGoal::Creation => Err(LifecycleError::validation(format!(
                "no pending operation recorded for instance {}",
                handle.id
            ))),
            ResourceGoal::Deletion => {
                if self.api.instance_exists(&handle.id).await? {
                    Ok(ResourcePoll::Pending {
                        status: "PRESENT".to_owned(),
                    })
                } else {
                    Ok(ResourcePoll::Gone)
                }
            }
        }
    }

    async fn output_value(&self, handle: &ResourceHandle, key: &str) -> Result<String> {
        // Instances expose a single interesting output.
        if key != "InstanceIP" {
            return Err(LifecycleError::validation(format!(
                "instance backend has no output '{}'",
                key
            )));
        }
        match self.api.instance_ip(&handle.id).await? {
            Some(ip) => Ok(ip),
            None => Err(LifecycleError::transport(format!(
                "instance {} has no public address yet",
                handle.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedInstanceApi {
        probes: Mutex<VecDeque<OperationProbe>>,
        exists: bool,
        ip: Option<String>,
    }

    impl ScriptedInstanceApi {
        fn new(probes: Vec<OperationProbe>) -> Self {
            Self {
                probes: Mutex::new(probes.into()),
                exists: false,
                ip: Some("203.0.113.9".to_owned()),
            }
        }
    }

    #[async_trait]
    impl InstanceApi for ScriptedInstanceApi {
        async fn start_instance(&self, name: &str, _request: &CreateRequest) -> Result<String> {
            Ok(format!("operation-create-{name}"))
        }

        async fn delete_instance(&self, name: &str) -> Result<String> {
            Ok(format!("operation-delete-{name}"))
        }

        async fn operation(&self, _operation: &str) -> Result<OperationProbe> {
            Ok(self
                .probes
                .lock()
                .pop_front()
                .unwrap_or(OperationProbe::Running))
        }

        async fn instance_exists(&self, _name: &str) -> Result<bool> {
            Ok(self.exists)
        }

        async fn instance_ip(&self, _name: &str) -> Result<Option<String>> {
            Ok(self.ip.clone())
        }
    }

    #[tokio::test]
    async fn creation_polls_the_launch_operation() {
        let backend = InstanceBackend::new(Arc::new(ScriptedInstanceApi::new(vec![
            OperationProbe::Running,
            OperationProbe::Done { error: None },
        ])));
        let handle = backend
            .create("env-ctl", &CreateRequest::default())
            .await
            .unwrap();

        assert_eq!(
            backend.poll(&handle, ResourceGoal::Creation).await.unwrap(),
            ResourcePoll::Pending {
                status: "RUNNING".to_owned()
            }
        );
        assert_eq!(
            backend.poll(&handle, ResourceGoal::Creation).await.unwrap(),
            ResourcePoll::Satisfied
        );
    }

    #[tokio::test]
    async fn operation_error_is_a_terminal_failure() {
        let backend = InstanceBackend::new(Arc::new(ScriptedInstanceApi::new(vec![
            OperationProbe::Done {
                error: Some("quota exceeded".to_owned()),
            },
        ])));
        let handle = backend
            .create("env-ctl", &CreateRequest::default())
            .await
            .unwrap();

        match backend.poll(&handle, ResourceGoal::Creation).await.unwrap() {
            ResourcePoll::Failed { reason, .. } => assert_eq!(reason, "quota exceeded"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovered_handle_deletion_falls_back_to_existence_check() {
        let backend = InstanceBackend::new(Arc::new(ScriptedInstanceApi::new(vec![])));
        let handle = ResourceHandle::new("env-ctl");

        // No operation was recorded in this process and the instance is
        // already gone, so the deletion goal is satisfied.
        assert_eq!(
            backend.poll(&handle, ResourceGoal::Deletion).await.unwrap(),
            ResourcePoll::Gone
        );
    }

    #[tokio::test]
    async fn instance_ip_is_the_only_output() {
        let backend = InstanceBackend::new(Arc::new(ScriptedInstanceApi::new(vec![])));
        let handle = ResourceHandle::new("env-ctl");

        assert_eq!(
            backend.output_value(&handle, "InstanceIP").await.unwrap(),
            "203.0.113.9"
        );
        assert!(backend.output_value(&handle, "VpcId").await.is_err());
    }
}

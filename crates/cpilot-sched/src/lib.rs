//! ---
//! cpilot_section: "04-scheduling-jobs"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Scheduler adapters for job submission and status."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;

use cpilot_common::{LifecycleError, Result};
use cpilot_controlplane::ControlPlane;

pub mod cloudq;
pub mod slurm;
pub mod state;
pub mod torque;

pub use cloudq::Cloudq;
pub use slurm::Slurm;
pub use state::JobState;
pub use torque::Torque;

/// Scheduler discriminators with a compiled-in adapter.
pub const KNOWN_SCHEDULERS: &[&str] = &["cloudq", "slurm", "torque"];

/// Output of a command executed on a remote node.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Seam for running scheduler commands on the login node. Implemented by the
/// remote transport; tests substitute scripted runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// The submit/cancel/monitor command triple of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCommands {
    pub submit: &'static str,
    pub cancel: &'static str,
    pub monitor: &'static str,
}

/// Shape parameters for generated job script headers.
#[derive(Debug, Clone)]
pub struct HeaderRequest {
    pub nodes: u32,
    pub cores: u32,
    pub wall_time: String,
    pub job_label: String,
    pub shared_dir: String,
}

/// Everything a submit needs from the surrounding lifecycle.
pub struct SubmitContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub script_remote_path: &'a str,
    pub script_name: &'a str,
    pub api_key: Option<&'a str>,
}

/// Everything a status poll needs from the surrounding lifecycle.
pub struct StatusContext<'a> {
    pub control: &'a dyn ControlPlane,
    pub login_endpoint: &'a str,
    pub job_id: &'a str,
    pub scheduler_name: &'a str,
    pub api_key: Option<&'a str>,
    pub user_name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    /// Name the scheduler files the job under; artifact files are named
    /// `<job_name><job_id>.e` and `.o`.
    pub job_name: String,
    pub scheduler_name: String,
}

/// Capability interface over one scheduler flavour.
///
/// Header generation and the command triple are synchronous and fallible only
/// on unsupported combinations; submit and status are implemented by the
/// bundled scheduler and rejected by adapters that only ship headers.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    fn commands(&self) -> SchedulerCommands;

    fn parent_header(&self, request: &HeaderRequest) -> Result<String>;

    fn child_header(&self, request: &HeaderRequest) -> Result<String>;

    /// Resolve credentials required for submission, if the scheduler uses any.
    async fn prepare(&self, _control: &dyn ControlPlane) -> Result<Option<String>> {
        Ok(None)
    }

    async fn submit(&self, _context: SubmitContext<'_>) -> Result<SubmittedJob> {
        Err(LifecycleError::validation(format!(
            "job submission is not implemented for {}",
            self.kind()
        )))
    }

    async fn status(&self, _context: StatusContext<'_>) -> Result<JobState> {
        Err(LifecycleError::validation(format!(
            "job status is not implemented for {}",
            self.kind()
        )))
    }
}

impl std::fmt::Debug for dyn SchedulerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn SchedulerAdapter")
    }
}

/// Resolve a scheduler discriminator to its adapter.
pub fn adapter_for(scheduler: &str, user_name: &str) -> Result<Arc<dyn SchedulerAdapter>> {
    match scheduler {
        "cloudq" => Ok(Arc::new(Cloudq::new(user_name))),
        "slurm" => Ok(Arc::new(Slurm)),
        "torque" => Ok(Arc::new(Torque)),
        other => Err(LifecycleError::validation(format!(
            "unknown scheduler '{}', expected one of: {}",
            other,
            KNOWN_SCHEDULERS.join(", ")
        ))),
    }
}

//! ---
//! cpilot_section: "04-scheduling-jobs"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Scheduler adapters for job submission and status."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use cpilot_common::{LifecycleError, Result};
use cpilot_controlplane::ControlPlane;

use crate::{
    HeaderRequest, JobState, SchedulerAdapter, SchedulerCommands, StatusContext, SubmitContext,
    SubmittedJob,
};

const SUBMIT_MARKER: &str = "The job has successfully been submitted to the scheduler";
const GONE_MARKER: &str = "The specified job Id does not exist in the database.";

/// The bundled elastic scheduler. Jobs are submitted with `cqsub` on the
/// login node and tracked through the control plane's `cqstat` route; both
/// require a per-user API key.
pub struct Cloudq {
    user_name: String,
}

impl Cloudq {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
        }
    }

    async fn find_key(&self, control: &dyn ControlPlane) -> Result<Option<String>> {
        let keys = control.list_api_keys().await?;
        Ok(keys
            .into_iter()
            .find(|record| record.user_name == self.user_name)
            .map(|record| record.key))
    }
}

#[async_trait]
impl SchedulerAdapter for Cloudq {
    fn kind(&self) -> &'static str {
        "cloudq"
    }

    fn commands(&self) -> SchedulerCommands {
        SchedulerCommands {
            submit: "cqsub",
            cancel: "cqdel",
            monitor: "cqstat",
        }
    }

    // The scheduler provisions nodes per job, so scripts need no resource
    // directives beyond the shebang.
    fn parent_header(&self, _request: &HeaderRequest) -> Result<String> {
        Ok("#!/bin/bash\n".to_owned())
    }

    fn child_header(&self, _request: &HeaderRequest) -> Result<String> {
        Ok("#!/bin/bash\n".to_owned())
    }

    /// Fetch the user's API key, generating one on first use.
    async fn prepare(&self, control: &dyn ControlPlane) -> Result<Option<String>> {
        if let Some(key) = self.find_key(control).await? {
            debug!(user = %self.user_name, "reusing existing scheduler api key");
            return Ok(Some(key));
        }

        control.generate_api_key().await?;
        match self.find_key(control).await? {
            Some(key) => {
                info!(user = %self.user_name, "generated a new scheduler api key");
                Ok(Some(key))
            }
            None => Err(LifecycleError::transport(format!(
                "api key for {} was generated but did not appear in the key list",
                self.user_name
            ))),
        }
    }

    async fn submit(&self, context: SubmitContext<'_>) -> Result<SubmittedJob> {
        let api_key = context.api_key.ok_or_else(|| {
            LifecycleError::validation("cloudq submission requires an api key")
        })?;
        let command = format!("cqsub -js {} -i {}", context.script_remote_path, api_key);
        let output = context.runner.run(&command).await?;

        if !output.stdout.contains(SUBMIT_MARKER) {
            return Err(LifecycleError::job(
                context.script_name,
                format!(
                    "cqsub did not accept the job: {}{}",
                    output.stdout.trim(),
                    output.stderr.trim()
                ),
            ));
        }

        // "... submitted to the scheduler <name> ... job id is: <id> ..."
        let scheduler_name = output
            .stdout
            .split("been submitted to the scheduler ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| {
                LifecycleError::job(context.script_name, "cqsub output carried no scheduler name")
            })?;
        let job_id = output
            .stdout
            .split("job id is: ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| {
                LifecycleError::job(context.script_name, "cqsub output carried no job id")
            })?;

        // The scheduler files the job under the script name minus its
        // extension; stdout/stderr artifacts inherit that label.
        let job_name = context
            .script_name
            .strip_suffix(".sh")
            .unwrap_or(context.script_name);

        info!(job_id, job_name, scheduler = scheduler_name, "job submitted");
        Ok(SubmittedJob {
            job_id: job_id.to_owned(),
            job_name: job_name.to_owned(),
            scheduler_name: scheduler_name.to_owned(),
        })
    }

    async fn status(&self, context: StatusContext<'_>) -> Result<JobState> {
        let api_key = context.api_key.ok_or_else(|| {
            LifecycleError::validation("cloudq status requires an api key")
        })?;
        let payload = json!({
            "jobId": context.job_id,
            "userName": "",
            "password": "",
            "verbose": false,
            "schedulerName": context.scheduler_name,
            "jobInfoRequest": false,
            "apiKey": api_key,
            "printErrors": "False",
            "remoteUserName": context.user_name,
        });

        let value = context
            .control
            .scheduler_request(context.login_endpoint, "cqstat", &payload)
            .await?;
        if value["status"].as_str() != Some("success") {
            return Err(LifecycleError::transport(format!(
                "cqstat failed for job {}: {}",
                context.job_id,
                value["payload"]
            )));
        }

        let message = value["payload"]["message"].as_str().unwrap_or_default();
        if message.contains(GONE_MARKER) {
            return Err(LifecycleError::job(
                context.job_id,
                "the job is no longer known to the scheduler; it may have been cancelled with cqdel",
            ));
        }

        let token = message
            .split_whitespace()
            .last()
            .unwrap_or_default();
        Ok(JobState::parse(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandOutput, CommandRunner};
    use parking_lot::Mutex;

    struct ScriptedRunner {
        commands: Mutex<Vec<String>>,
        stdout: String,
    }

    impl ScriptedRunner {
        fn new(stdout: &str) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                stdout: stdout.to_owned(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &str) -> Result<CommandOutput> {
            self.commands.lock().push(command.to_owned());
            Ok(CommandOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    #[tokio::test]
    async fn submit_parses_job_id_and_scheduler_name() {
        let runner = ScriptedRunner::new(
            "The job has successfully been submitted to the scheduler econ1 \
             and is currently being processed. The job id is: 4172 you can \
             use this id to look up the job status.",
        );
        let adapter = Cloudq::new("rstaff");

        let submitted = adapter
            .submit(SubmitContext {
                runner: &runner,
                script_remote_path: "/home/rstaff/run.sh",
                script_name: "run.sh",
                api_key: Some("key-123"),
            })
            .await
            .unwrap();

        assert_eq!(submitted.job_id, "4172");
        assert_eq!(submitted.job_name, "run");
        assert_eq!(submitted.scheduler_name, "econ1");
        assert_eq!(
            runner.commands.lock().as_slice(),
            ["cqsub -js /home/rstaff/run.sh -i key-123"]
        );
    }

    #[tokio::test]
    async fn rejected_submission_is_a_job_error() {
        let runner = ScriptedRunner::new("Unable to validate the provided api key.");
        let adapter = Cloudq::new("rstaff");

        let err = adapter
            .submit(SubmitContext {
                runner: &runner,
                script_remote_path: "/home/rstaff/run.sh",
                script_name: "run.sh",
                api_key: Some("key-123"),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Job { .. }));
    }

    #[tokio::test]
    async fn submit_without_api_key_is_rejected() {
        let runner = ScriptedRunner::new("");
        let adapter = Cloudq::new("rstaff");

        let err = adapter
            .submit(SubmitContext {
                runner: &runner,
                script_remote_path: "/home/rstaff/run.sh",
                script_name: "run.sh",
                api_key: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Validation { .. }));
        assert!(runner.commands.lock().is_empty());
    }
}

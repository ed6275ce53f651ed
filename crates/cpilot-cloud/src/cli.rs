//! ---
//! cpilot_section: "02-cloud-backends"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Cloud resource backends for control resource provisioning."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use cpilot_common::{LifecycleError, Result};

use crate::instance::{InstanceApi, OperationProbe};
use crate::stack::{StackApi, StackProbe};
use crate::CreateRequest;

struct CliOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

async fn run(program: &str, args: &[String]) -> Result<CliOutput> {
    debug!(%program, ?args, "invoking provider cli");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| LifecycleError::transport(format!("failed to run {program}: {err}")))?;
    Ok(CliOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

fn require_success(program: &str, output: &CliOutput) -> Result<()> {
    if output.success {
        Ok(())
    } else {
        Err(LifecycleError::transport(format!(
            "{program} exited with an error: {}",
            output.stderr.trim()
        )))
    }
}

fn parse_json(program: &str, stdout: &str) -> Result<Value> {
    serde_json::from_str(stdout).map_err(|err| {
        LifecycleError::transport(format!("{program} returned unparseable output: {err}"))
    })
}

/// Stack operations driven through the `aws` CLI.
pub struct AwsCliStackApi {
    region: String,
}

impl AwsCliStackApi {
    pub fn new(region: String) -> Self {
        Self { region }
    }

    fn base_args(&self, subcommand: &str) -> Vec<String> {
        vec![
            "cloudformation".to_owned(),
            subcommand.to_owned(),
            "--region".to_owned(),
            self.region.clone(),
            "--output".to_owned(),
            "json".to_owned(),
        ]
    }
}

#[async_trait]
impl StackApi for AwsCliStackApi {
    async fn create_stack(
        &self,
        name: &str,
        template_body: &str,
        parameters: &IndexMap<String, String>,
    ) -> Result<String> {
        let mut args = self.base_args("create-stack");
        args.push("--stack-name".to_owned());
        args.push(name.to_owned());
        args.push("--template-body".to_owned());
        args.push(template_body.to_owned());
        args.push("--capabilities".to_owned());
        args.push("CAPABILITY_IAM".to_owned());
        if !parameters.is_empty() {
            args.push("--parameters".to_owned());
            for (key, value) in parameters {
                args.push(format!("ParameterKey={key},ParameterValue={value}"));
            }
        }

        let output = run("aws", &args).await?;
        require_success("aws", &output)?;
        let body = parse_json("aws", &output.stdout)?;
        body["StackId"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| LifecycleError::transport("create-stack returned no StackId"))
    }

    async fn delete_stack(&self, id: &str) -> Result<()> {
        let mut args = self.base_args("delete-stack");
        args.push("--stack-name".to_owned());
        args.push(id.to_owned());

        let output = run("aws", &args).await?;
        require_success("aws", &output)
    }

    async fn probe(&self, id: &str) -> Result<StackProbe> {
        let mut args = self.base_args("describe-stack-events");
        args.push("--stack-name".to_owned());
        args.push(id.to_owned());

        let output = run("aws", &args).await?;
        if !output.success {
            if output.stderr.contains("does not exist") {
                return Ok(StackProbe::Missing);
            }
            require_success("aws", &output)?;
        }

        let body = parse_json("aws", &output.stdout)?;
        let events = body["StackEvents"].as_array().cloned().unwrap_or_default();

        // Events are newest first; the stack-level event carries the status
        // the lifecycle cares about, other resources only contribute the
        // failure reason.
        let status = events
            .iter()
            .find(|event| event["ResourceType"].as_str() == Some("AWS::CloudFormation::Stack"))
            .and_then(|event| event["ResourceStatus"].as_str())
            .unwrap_or("UNKNOWN")
            .to_owned();
        let reason = events
            .iter()
            .find_map(|event| event["ResourceStatusReason"].as_str())
            .unwrap_or_default()
            .to_owned();

        Ok(StackProbe::Status { status, reason })
    }

    async fn output(&self, id: &str, key: &str) -> Result<Option<String>> {
        let mut args = self.base_args("describe-stacks");
        args.push("--stack-name".to_owned());
        args.push(id.to_owned());

        let output = run("aws", &args).await?;
        require_success("aws", &output)?;
        let body = parse_json("aws", &output.stdout)?;
        let outputs = body["Stacks"][0]["Outputs"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(outputs.iter().find_map(|entry| {
            let output_key = entry["OutputKey"].as_str()?;
            if output_key.contains(key) {
                entry["OutputValue"].as_str().map(str::to_owned)
            } else {
                None
            }
        }))
    }
}

/// Instance operations driven through the `gcloud` CLI.
pub struct GcloudInstanceApi {
    project: String,
    zone: String,
}

impl GcloudInstanceApi {
    pub fn new(project: String, zone: String) -> Self {
        Self { project, zone }
    }

    fn scope_args(&self) -> Vec<String> {
        vec![
            "--project".to_owned(),
            self.project.clone(),
            "--zone".to_owned(),
            self.zone.clone(),
            "--format".to_owned(),
            "json".to_owned(),
        ]
    }
}

fn operation_name(body: &Value) -> Result<String> {
    let candidate = match body {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    candidate["name"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| LifecycleError::transport("gcloud returned no operation name"))
}

#[async_trait]
impl InstanceApi for GcloudInstanceApi {
    async fn start_instance(&self, name: &str, request: &CreateRequest) -> Result<String> {
        let mut args = vec![
            "compute".to_owned(),
            "instances".to_owned(),
            "create".to_owned(),
            name.to_owned(),
            "--async".to_owned(),
        ];
        if let Some(image) = request.parameters.get("source_image") {
            args.push("--image".to_owned());
            args.push(image.clone());
        }
        if let Some(machine) = request.parameters.get("instance_type") {
            args.push("--machine-type".to_owned());
            args.push(machine.clone());
        }
        args.extend(self.scope_args());

        let output = run("gcloud", &args).await?;
        require_success("gcloud", &output)?;
        operation_name(&parse_json("gcloud", &output.stdout)?)
    }

    async fn delete_instance(&self, name: &str) -> Result<String> {
        let mut args = vec![
            "compute".to_owned(),
            "instances".to_owned(),
            "delete".to_owned(),
            name.to_owned(),
            "--quiet".to_owned(),
            "--async".to_owned(),
        ];
        args.extend(self.scope_args());

        let output = run("gcloud", &args).await?;
        require_success("gcloud", &output)?;
        operation_name(&parse_json("gcloud", &output.stdout)?)
    }

    async fn operation(&self, operation: &str) -> Result<OperationProbe> {
        let mut args = vec![
            "compute".to_owned(),
            "operations".to_owned(),
            "describe".to_owned(),
            operation.to_owned(),
        ];
        args.extend(self.scope_args());

        let output = run("gcloud", &args).await?;
        require_success("gcloud", &output)?;
        let body = parse_json("gcloud", &output.stdout)?;
        if body["status"].as_str() == Some("DONE") {
            let error = body["error"]["errors"][0]["message"]
                .as_str()
                .map(str::to_owned);
            Ok(OperationProbe::Done { error })
        } else {
            Ok(OperationProbe::Running)
        }
    }

    async fn instance_exists(&self, name: &str) -> Result<bool> {
        let mut args = vec![
            "compute".to_owned(),
            "instances".to_owned(),
            "describe".to_owned(),
            name.to_owned(),
        ];
        args.extend(self.scope_args());

        let output = run("gcloud", &args).await?;
        if output.success {
            return Ok(true);
        }
        if output.stderr.to_lowercase().contains("not found") {
            return Ok(false);
        }
        Err(LifecycleError::transport(format!(
            "gcloud exited with an error: {}",
            output.stderr.trim()
        )))
    }

    async fn instance_ip(&self, name: &str) -> Result<Option<String>> {
        let mut args = vec![
            "compute".to_owned(),
            "instances".to_owned(),
            "describe".to_owned(),
            name.to_owned(),
        ];
        args.extend(self.scope_args());

        let output = run("gcloud", &args).await?;
        require_success("gcloud", &output)?;
        let body = parse_json("gcloud", &output.stdout)?;
        Ok(body["networkInterfaces"][0]["accessConfigs"][0]["natIP"]
            .as_str()
            .map(str::to_owned))
    }
}

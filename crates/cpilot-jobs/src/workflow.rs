//! ---
//! cpilot_section: "05-job-execution"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Job script upload, submission, monitoring and artifact download."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use cpilot_common::Result;

/// A multi-step computation templated over an environment, as opposed to a
/// single job script. `run` kicks the work off and returns the payload
/// `monitor` needs to watch it finish.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<Value>;

    async fn monitor(&self, payload: Value) -> Result<()>;
}

/// Kick a workflow off and watch it through to completion.
pub async fn run_to_completion(workflow: &dyn Workflow) -> Result<()> {
    info!(workflow = %workflow.name(), "starting workflow");
    let payload = workflow.run().await?;
    workflow.monitor(payload).await?;
    info!(workflow = %workflow.name(), "workflow finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorded {
        payloads: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Workflow for Recorded {
        fn name(&self) -> &str {
            "sweep"
        }

        async fn run(&self) -> Result<Value> {
            Ok(json!({"batch": "b-17"}))
        }

        async fn monitor(&self, payload: Value) -> Result<()> {
            self.payloads.lock().push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn monitor_receives_the_run_payload() {
        let workflow = Recorded {
            payloads: Mutex::new(Vec::new()),
        };
        run_to_completion(&workflow).await.unwrap();
        assert_eq!(
            workflow.payloads.lock().as_slice(),
            [json!({"batch": "b-17"})]
        );
    }
}

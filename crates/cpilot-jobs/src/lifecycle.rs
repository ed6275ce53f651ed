//! ---
//! cpilot_section: "05-job-execution"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Job script upload, submission, monitoring and artifact download."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use cpilot_common::config::PollingConfig;
use cpilot_common::{LifecycleError, Result};
use cpilot_controlplane::{with_warmup, ControlPlane};
use cpilot_sched::{adapter_for, JobState, StatusContext, SubmitContext, SubmittedJob};

use crate::batch::BatchEntry;
use crate::descriptor::{JobDescriptor, UploadProtocol};
use crate::transport::{RemoteTransport, SshTransport, WebDavClient};

/// Builds a transport once the login node's address is known. The address
/// only exists after the environment has spun up, so construction is
/// deferred to [`JobLifecycle::open_session`].
pub type TransportFactory = Box<dyn Fn(&str) -> Arc<dyn RemoteTransport> + Send + Sync>;

/// An ssh/scp transport factory for the given account.
pub fn ssh_factory(user_name: &str, key_path: Option<std::path::PathBuf>) -> TransportFactory {
    let user_name = user_name.to_owned();
    Box::new(move |host| Arc::new(SshTransport::new(host, &user_name, key_path.clone())))
}

/// Connection state for one run-jobs stage: the resolved login node plus a
/// transport bound to it.
pub struct JobSession {
    pub login_endpoint: String,
    pub(crate) transport: Arc<dyn RemoteTransport>,
}

/// Result of running one job script to completion (or to submission, for
/// jobs left to batch monitoring).
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: String,
    pub job_id: String,
    pub scheduler_name: String,
}

/// Drives a job script through upload, submission, monitoring and artifact
/// download against a spun-up environment.
pub struct JobLifecycle {
    control: Arc<dyn ControlPlane>,
    make_transport: TransportFactory,
    webdav: WebDavClient,
    user_name: String,
    polling: PollingConfig,
}

impl JobLifecycle {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        make_transport: TransportFactory,
        user_name: impl Into<String>,
        password: impl Into<String>,
        polling: PollingConfig,
    ) -> Self {
        let user_name = user_name.into();
        let password = password.into();
        Self {
            control,
            make_transport,
            webdav: WebDavClient::new(user_name.clone(), password),
            user_name,
            polling,
        }
    }

    /// Resolve the environment's login node and bind a transport to it.
    ///
    /// The lookup is retried on transient failures: right after spin-up the
    /// control plane may still be settling.
    pub async fn open_session(&self, environment: &str) -> Result<JobSession> {
        self.control.ensure_session().await?;

        let control = Arc::clone(&self.control);
        let name = environment.to_owned();
        let parts = with_warmup(self.polling.warmup_policy(), "login node lookup", || {
            let control = Arc::clone(&control);
            let name = name.clone();
            async move { control.cluster_part(&name, "Utility", "Utility").await }
        })
        .await?;

        let login_endpoint = login_node_domain(&parts)?;
        info!(%login_endpoint, "resolved the environment's login node");
        let transport = (self.make_transport)(&login_endpoint);
        Ok(JobSession {
            login_endpoint,
            transport,
        })
    }

    /// Upload the script (when requested), resolve scheduler credentials and
    /// submit. Monitoring is left to the caller.
    pub async fn submit_job(
        &self,
        session: &JobSession,
        descriptor: &JobDescriptor,
    ) -> Result<BatchEntry> {
        if descriptor.upload_script {
            match descriptor.upload_protocol {
                UploadProtocol::Sftp => {
                    session
                        .transport
                        .upload(&descriptor.local_path, &descriptor.remote_script_path())
                        .await?;
                }
                UploadProtocol::WebDav => {
                    self.webdav
                        .put_script(
                            &session.login_endpoint,
                            &descriptor.remote_path,
                            &descriptor.local_path,
                        )
                        .await?;
                }
            }
            info!(job = %descriptor.name, "job script uploaded");
        }

        let adapter = adapter_for(&descriptor.scheduler, &self.user_name)?;
        let api_key = adapter.prepare(self.control.as_ref()).await?;
        let submitted = adapter
            .submit(SubmitContext {
                runner: session.transport.as_runner(),
                script_remote_path: &descriptor.remote_script_path(),
                script_name: &descriptor.name,
                api_key: api_key.as_deref(),
            })
            .await?;

        Ok(BatchEntry {
            descriptor: descriptor.clone(),
            submitted,
            api_key,
        })
    }

    /// Run one job script end to end. Jobs flagged `monitor_job = false` are
    /// submitted and returned immediately for batch monitoring.
    pub async fn process(
        &self,
        session: &JobSession,
        descriptor: &JobDescriptor,
    ) -> Result<JobOutcome> {
        let entry = self.submit_job(session, descriptor).await?;
        let outcome = JobOutcome {
            job: descriptor.name.clone(),
            job_id: entry.submitted.job_id.clone(),
            scheduler_name: entry.submitted.scheduler_name.clone(),
        };

        if !descriptor.monitor_job {
            return Ok(outcome);
        }

        self.monitor(session, &entry).await?;
        self.download_artifacts(session, descriptor, &entry.submitted)
            .await?;
        Ok(outcome)
    }

    /// Poll the job until it reaches a terminal state.
    ///
    /// Submitted and Running are polled at the fast cadence, provisioning
    /// states at the slow one. A non-zero descriptor timeout bounds the
    /// total wait; zero waits for as long as the job takes.
    pub async fn monitor(&self, session: &JobSession, entry: &BatchEntry) -> Result<()> {
        let mut waited = Duration::ZERO;
        loop {
            let state = self.job_state(session, entry).await?;
            match state {
                JobState::Completed => {
                    info!(job = %entry.descriptor.name, job_id = %entry.submitted.job_id, "job completed");
                    return Ok(());
                }
                state if state.is_failure() => {
                    return Err(LifecycleError::job(
                        &entry.descriptor.name,
                        format!("the job ended in the {state} state"),
                    ));
                }
                state => {
                    if !entry.descriptor.unbounded() && waited >= entry.descriptor.timeout {
                        return Err(LifecycleError::timeout(
                            format!("job {}", entry.descriptor.name),
                            waited,
                        ));
                    }
                    let interval = if state.is_active() {
                        self.polling.job_running_interval
                    } else {
                        self.polling.job_provisioning_interval
                    };
                    info!(job = %entry.descriptor.name, %state, "job still in flight");
                    tokio::time::sleep(interval).await;
                    waited += interval;
                }
            }
        }
    }

    pub(crate) fn batch_interval(&self) -> Duration {
        self.polling.batch_interval
    }

    pub(crate) async fn job_state(
        &self,
        session: &JobSession,
        entry: &BatchEntry,
    ) -> Result<JobState> {
        let adapter = adapter_for(&entry.descriptor.scheduler, &self.user_name)?;
        adapter
            .status(StatusContext {
                control: self.control.as_ref(),
                login_endpoint: &session.login_endpoint,
                job_id: &entry.submitted.job_id,
                scheduler_name: &entry.submitted.scheduler_name,
                api_key: entry.api_key.as_deref(),
                user_name: &self.user_name,
            })
            .await
    }

    /// Fetch the job's stdout/stderr artifacts into the download directory.
    /// The scheduler writes them as `<jobName><jobId>.e` and `<jobName><jobId>.o`
    /// in the execute directory, using the name it reported at submission.
    pub async fn download_artifacts(
        &self,
        session: &JobSession,
        descriptor: &JobDescriptor,
        submitted: &SubmittedJob,
    ) -> Result<()> {
        for extension in ["e", "o"] {
            let file_name = format!("{}{}.{}", submitted.job_name, submitted.job_id, extension);
            let remote = format!("{}/{}", descriptor.execute_directory, file_name);
            let local = descriptor.download_directory.join(&file_name);
            if let Err(err) = session.transport.download(&remote, &local).await {
                warn!(job = %descriptor.name, %remote, "artifact download failed: {err}");
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Pick the login node out of the environment's utility instance group.
fn login_node_domain(parts: &Value) -> Result<String> {
    let instances = match parts {
        Value::Array(instances) => instances.as_slice(),
        single @ Value::Object(_) => std::slice::from_ref(single),
        _ => {
            return Err(LifecycleError::transport(
                "the utility instance listing was not parseable",
            ))
        }
    };

    instances
        .iter()
        .find(|part| part["RecType"].as_str() == Some("WebDavNode"))
        .and_then(|part| part["domainName"].as_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            LifecycleError::provider(
                "missing",
                "the environment reported no login node with a domain name",
            )
        })
}


#[cfg(test)]
mod tests {
    use super::testing::{descriptor, lifecycle, MockControl, MockTransport};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn process_runs_the_full_job_pipeline() {
        let control = Arc::new(MockControl::with_statuses(&[
            "CreatingInstances",
            "Running",
            "Completed",
        ]));
        let transport = Arc::new(MockTransport::new());
        let lifecycle = lifecycle(control, transport.clone());

        let session = lifecycle.open_session("bio-sim-a1b2").await.unwrap();
        assert_eq!(session.login_endpoint, "login.example.org");

        let outcome = lifecycle.process(&session, &descriptor()).await.unwrap();
        assert_eq!(outcome.job_id, "4172");
        assert_eq!(outcome.scheduler_name, "econ1");

        let uploads = transport.uploads.lock();
        assert_eq!(
            uploads.as_slice(),
            [("/tmp/run.sh".to_owned(), "/home/rstaff/run.sh".to_owned())]
        );
        let commands = transport.commands.lock();
        assert_eq!(
            commands.as_slice(),
            ["cqsub -js /home/rstaff/run.sh -i key-123"]
        );
        let downloads = transport.downloads.lock();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[0].0, "/home/rstaff/run4172.e");
        assert_eq!(downloads[1].0, "/home/rstaff/run4172.o");
    }

    #[tokio::test]
    async fn jobs_ending_in_error_fail_the_run() {
        let control = Arc::new(MockControl::with_statuses(&["Running", "Error"]));
        let transport = Arc::new(MockTransport::new());
        let lifecycle = lifecycle(control, transport.clone());

        let session = lifecycle.open_session("bio-sim-a1b2").await.unwrap();
        let err = lifecycle.process(&session, &descriptor()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Job { .. }));
        assert!(transport.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn bounded_jobs_time_out() {
        let states: Vec<&str> = std::iter::repeat("Running").take(64).collect();
        let control = Arc::new(MockControl::with_statuses(&states));
        let transport = Arc::new(MockTransport::new());
        let lifecycle = lifecycle(control, transport.clone());

        let mut bounded = descriptor();
        bounded.timeout = Duration::from_millis(3);

        let session = lifecycle.open_session("bio-sim-a1b2").await.unwrap();
        let err = lifecycle.process(&session, &bounded).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unbounded_jobs_outwait_any_fixed_ceiling() {
        let states: Vec<&str> = std::iter::repeat("Running").take(256).collect();
        let control = Arc::new(MockControl::with_statuses(&states));
        let transport = Arc::new(MockTransport::new());
        let lifecycle = lifecycle(control, transport.clone());

        let session = lifecycle.open_session("bio-sim-a1b2").await.unwrap();
        let entry = lifecycle.submit_job(&session, &descriptor()).await.unwrap();
        assert!(entry.descriptor.unbounded());

        // A timeout of zero polls for as long as the scheduler reports the
        // job in flight; the watch has to be cut short from the outside.
        let watch = tokio::time::timeout(
            Duration::from_millis(30),
            lifecycle.monitor(&session, &entry),
        )
        .await;
        assert!(watch.is_err(), "an unbounded monitor returned on its own");
    }

    #[tokio::test]
    async fn unmonitored_jobs_return_right_after_submission() {
        let control = Arc::new(MockControl::with_statuses(&[]));
        let transport = Arc::new(MockTransport::new());
        let lifecycle = lifecycle(control, transport.clone());

        let mut fire_and_forget = descriptor();
        fire_and_forget.monitor_job = false;

        let session = lifecycle.open_session("bio-sim-a1b2").await.unwrap();
        let outcome = lifecycle.process(&session, &fire_and_forget).await.unwrap();
        assert_eq!(outcome.job_id, "4172");
        assert!(transport.downloads.lock().is_empty());
    }

    #[test]
    fn login_node_lookup_requires_a_webdav_node() {
        let err = login_node_domain(&json!([{"RecType": "Scheduler"}])).unwrap_err();
        assert!(matches!(err, LifecycleError::Provider { .. }));

        let domain = login_node_domain(&json!([
            {"RecType": "WebDavNode", "domainName": "login.example.org"}
        ]))
        .unwrap();
        assert_eq!(domain, "login.example.org");
    }
}

//! ---
//! cpilot_section: "05-job-execution"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Job script upload, submission, monitoring and artifact download."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::time::Duration;

use tracing::{error, info};

use cpilot_common::{LifecycleError, Result};
use cpilot_sched::{JobState, SubmittedJob};

use crate::descriptor::JobDescriptor;
use crate::lifecycle::{JobLifecycle, JobSession};

/// One submitted job awaiting batch monitoring.
pub struct BatchEntry {
    pub descriptor: JobDescriptor,
    pub submitted: SubmittedJob,
    pub api_key: Option<String>,
}

/// What became of each job in a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl BatchReport {
    pub fn all_completed(&self) -> bool {
        self.failed.is_empty()
    }
}

impl JobLifecycle {
    /// Watch a set of already submitted jobs until all of them finish.
    ///
    /// The batch shares one timeout: the largest per-job timeout, unless any
    /// job asked for an unbounded wait, which unbounds the whole batch. A
    /// job that completes has its artifacts downloaded and leaves the batch;
    /// a job that fails is reported and leaves the batch without aborting
    /// the rest.
    pub async fn monitor_batch(
        &self,
        session: &JobSession,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchReport> {
        let timeout = shared_timeout(&entries);
        let mut remaining = entries;
        let mut report = BatchReport::default();
        let mut waited = Duration::ZERO;

        while !remaining.is_empty() {
            if let Some(ceiling) = timeout {
                if waited >= ceiling {
                    return Err(LifecycleError::timeout(
                        format!("batch of {} jobs", remaining.len()),
                        waited,
                    ));
                }
            }
            tokio::time::sleep(self.batch_interval()).await;
            waited += self.batch_interval();

            let mut still_running = Vec::with_capacity(remaining.len());
            for entry in remaining {
                let state = self.job_state(session, &entry).await?;
                match state {
                    JobState::Completed => {
                        if let Err(err) = self
                            .download_artifacts(session, &entry.descriptor, &entry.submitted)
                            .await
                        {
                            error!(job = %entry.descriptor.name, "artifact download failed: {err}");
                        }
                        info!(job = %entry.descriptor.name, "batch job completed");
                        report.completed.push(entry.descriptor.name);
                    }
                    state if state.is_failure() => {
                        error!(job = %entry.descriptor.name, %state, "batch job failed");
                        report.failed.push(entry.descriptor.name);
                    }
                    state => {
                        info!(job = %entry.descriptor.name, %state, "batch job still in flight");
                        still_running.push(entry);
                    }
                }
            }
            remaining = still_running;
            info!(
                done = report.completed.len() + report.failed.len(),
                remaining = remaining.len(),
                "batch monitoring round finished"
            );
        }

        Ok(report)
    }
}

fn shared_timeout(entries: &[BatchEntry]) -> Option<Duration> {
    if entries.iter().any(|entry| entry.descriptor.unbounded()) {
        return None;
    }
    entries
        .iter()
        .map(|entry| entry.descriptor.timeout)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::{lifecycle, MockControl, MockTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn entry(name: &str, timeout_secs: u64) -> BatchEntry {
        BatchEntry {
            descriptor: JobDescriptor::from_options(
                name,
                &json!({"timeout": timeout_secs}),
                "rstaff",
            )
            .unwrap(),
            submitted: SubmittedJob {
                job_id: "1".to_owned(),
                job_name: name.strip_suffix(".sh").unwrap_or(name).to_owned(),
                scheduler_name: "econ1".to_owned(),
            },
            api_key: Some("key-123".to_owned()),
        }
    }

    #[test]
    fn shared_timeout_is_the_largest_bound() {
        let entries = vec![entry("a.sh", 60), entry("b.sh", 600), entry("c.sh", 120)];
        assert_eq!(shared_timeout(&entries), Some(Duration::from_secs(600)));
    }

    #[test]
    fn any_unbounded_job_unbounds_the_batch() {
        let entries = vec![entry("a.sh", 60), entry("b.sh", 0)];
        assert_eq!(shared_timeout(&entries), None);
    }

    #[tokio::test]
    async fn failed_jobs_do_not_abort_their_siblings() {
        // Poll order per round follows entry order, so the queue below plays
        // out as: round one completes a.sh and keeps b.sh, round two fails b.sh.
        let control = Arc::new(MockControl::with_statuses(&[
            "Completed", "Running", "Error",
        ]));
        let transport = Arc::new(MockTransport::new());
        let lifecycle = lifecycle(control, transport.clone());

        let session = lifecycle.open_session("bio-sim-a1b2").await.unwrap();
        let report = lifecycle
            .monitor_batch(&session, vec![entry("a.sh", 60), entry("b.sh", 60)])
            .await
            .unwrap();

        assert_eq!(report.completed, ["a.sh"]);
        assert_eq!(report.failed, ["b.sh"]);
        assert!(!report.all_completed());

        // Only the completed job's artifacts came down.
        let downloads = transport.downloads.lock();
        assert_eq!(downloads.len(), 2);
        assert!(downloads.iter().all(|(remote, _)| remote.contains("a1.")));
    }
}

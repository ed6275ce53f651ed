//! ---
//! cpilot_section: "03-control-plane"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "REST client for the control plane running on the control resource."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use cpilot_common::{LifecycleError, PollPolicy, Result};

pub mod http;

pub use http::HttpControlPlane;

/// Whether a cluster has finished spinning up, per the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpinStatus {
    pub spun_up: bool,
    pub error: Option<String>,
}

/// Outcome of a terminate request.
///
/// The control plane blocks on this route while teardown runs, so the
/// request is sent with a short client timeout and a timed-out request
/// still counts as started; completion is observed by polling
/// [`ControlPlane::cluster_by_name`] until the record is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateAck {
    Completed,
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub user_name: String,
    pub key: String,
}

/// Capability interface over the control plane REST surface.
///
/// The endpoint is bound late: the control DNS name only exists once the
/// control resource stage has discovered it.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    fn set_endpoint(&self, dns: &str);
    fn endpoint(&self) -> Option<String>;
    fn has_session(&self) -> bool;

    /// Establish an authenticated session with the configured account.
    async fn login(&self) -> Result<()>;

    /// Establish a session unless one already exists.
    async fn ensure_session(&self) -> Result<()> {
        if self.has_session() {
            return Ok(());
        }
        self.login().await
    }

    /// Resolve the control DNS name by asking the freshly booted instance.
    async fn control_domain(&self, ip: &str) -> Result<String>;

    /// Confirm the control plane's storage tables have been generated.
    async fn storage_ready(&self) -> Result<()>;

    async fn set_db_throughput(&self, read: &str, write: &str) -> Result<()>;

    /// Persist a cluster descriptor under the given name.
    async fn save_cluster(&self, name: &str, descriptor: &Value) -> Result<()>;

    /// Kick off creation of a previously saved cluster.
    async fn start_cluster(&self, descriptor: &Value) -> Result<()>;

    /// Spin-up progress of a cluster under creation.
    async fn spinning_cluster(&self, name: &str) -> Result<SpinStatus>;

    /// Stored cluster record, or `None` once it has been removed.
    async fn cluster_by_name(&self, name: &str) -> Result<Option<Value>>;

    async fn terminate_cluster(&self, descriptor: &Value) -> Result<TerminateAck>;

    /// One instance group of a spinning cluster.
    async fn cluster_part(&self, name: &str, group: &str, kind: &str) -> Result<Value>;

    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>>;

    /// Generate a fresh API key for the logged-in account.
    async fn generate_api_key(&self) -> Result<String>;

    /// Post a scheduler payload to a node other than the control endpoint
    /// (jobs are submitted through the login node), reusing the session.
    async fn scheduler_request(&self, endpoint: &str, route: &str, payload: &Value)
        -> Result<Value>;
}

/// Retry a control plane call while it fails for transient reasons.
///
/// A control plane that has just booted refuses connections for a while, so
/// the first calls after a stage transition go through this loop. A
/// non-transient error aborts immediately.
pub async fn with_warmup<T, F, Fut>(policy: PollPolicy, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut waited = Duration::ZERO;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if policy.expired(waited) {
                    tracing::warn!(%operation, ?waited, "gave up retrying: {err}");
                    return Err(LifecycleError::timeout(operation, waited));
                }
                tracing::debug!(%operation, ?waited, "retrying after transient failure: {err}");
                tokio::time::sleep(policy.interval).await;
                waited += policy.interval;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn warmup_retries_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let policy = PollPolicy::bounded(Duration::from_millis(1), Duration::from_secs(1));

        let value = with_warmup(policy, "login", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LifecycleError::transport("connection refused"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn warmup_does_not_retry_terminal_failures() {
        let attempts = AtomicUsize::new(0);
        let policy = PollPolicy::bounded(Duration::from_millis(1), Duration::from_secs(1));

        let err = with_warmup(policy, "login", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(LifecycleError::validation("bad credentials")) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LifecycleError::Validation { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn warmup_times_out_eventually() {
        let policy = PollPolicy::bounded(Duration::from_millis(1), Duration::from_millis(3));

        let err = with_warmup(policy, "storage readiness", || async {
            Err::<(), _>(LifecycleError::transport("connection refused"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, LifecycleError::Timeout { .. }));
    }
}

//! ---
//! cpilot_section: "05-job-execution"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Job script upload, submission, monitoring and artifact download."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use cpilot_common::{LifecycleError, Result};

/// How the job script reaches the environment's shared filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProtocol {
    Sftp,
    WebDav,
}

/// What a `[jobs.scripts]` entry asks to run: a plain job script, or a
/// registered multi-step workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Script,
    Workflow,
}

impl JobKind {
    /// Read the `kind` option off a raw entry before full resolution.
    pub fn from_options(name: &str, options: &Value) -> Result<Self> {
        match options.get("kind").and_then(Value::as_str) {
            None => Ok(Self::Script),
            Some(raw) if raw.eq_ignore_ascii_case("script") => Ok(Self::Script),
            Some(raw) if raw.eq_ignore_ascii_case("workflow") => Ok(Self::Workflow),
            Some(other) => Err(LifecycleError::job(
                name,
                format!("unknown job kind '{other}', expected script or workflow"),
            )),
        }
    }
}

/// A fully resolved job entry from the `[jobs.scripts]` table.
///
/// Every option has an explicit default so a bare `{}` entry runs the script
/// out of the invoking directory under the user's home on the cluster.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Script file name as it appears in the configuration.
    pub name: String,
    /// Scheduler discriminator; jobs may override the run-wide default.
    pub scheduler: String,
    pub upload_script: bool,
    pub local_path: PathBuf,
    /// Directory on the cluster the script is uploaded into.
    pub remote_path: String,
    pub upload_protocol: UploadProtocol,
    /// When false the job is submitted and left for batch monitoring.
    pub monitor_job: bool,
    /// Directory the scheduler runs the job in; stdout/stderr land here.
    pub execute_directory: String,
    /// Ceiling on monitoring time. Zero means monitor until the job ends.
    pub timeout: Duration,
    /// Local directory output artifacts are downloaded into.
    pub download_directory: PathBuf,
}

impl JobDescriptor {
    /// Resolve a raw options table against the defaults.
    ///
    /// Booleans are accepted both as TOML booleans and as the strings
    /// "true"/"false"; anything else is rejected rather than guessed at.
    pub fn from_options(name: &str, options: &Value, user_name: &str) -> Result<Self> {
        let table = options.as_object().ok_or_else(|| {
            LifecycleError::job(name, "job options must be a table of settings")
        })?;

        let home = format!("/home/{user_name}");
        let upload_script = parse_bool(name, table.get("upload_script"), true)?;
        let monitor_job = parse_bool(name, table.get("monitor_job"), true)?;

        let local_path = match table.get("local_path").and_then(Value::as_str) {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir()?.join(name),
        };

        let remote_path = table
            .get("remote_path")
            .and_then(Value::as_str)
            .map(|p| p.trim_end_matches('/').to_owned())
            .unwrap_or_else(|| home.clone());

        let upload_protocol = match table.get("upload_protocol").and_then(Value::as_str) {
            None => UploadProtocol::Sftp,
            Some(raw) if raw.eq_ignore_ascii_case("sftp") => UploadProtocol::Sftp,
            Some(raw) if raw.eq_ignore_ascii_case("webdav") => UploadProtocol::WebDav,
            Some(other) => {
                return Err(LifecycleError::job(
                    name,
                    format!("unknown upload protocol '{other}', expected sftp or webdav"),
                ))
            }
        };

        let execute_directory = table
            .get("execute_directory")
            .and_then(Value::as_str)
            .map(|p| p.trim_end_matches('/').to_owned())
            .unwrap_or(home);

        let timeout = parse_timeout(name, table.get("timeout"))?;

        let download_directory = table
            .get("download_directory")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let scheduler = table
            .get("scheduler")
            .and_then(Value::as_str)
            .unwrap_or("cloudq")
            .to_owned();

        Ok(Self {
            name: name.to_owned(),
            scheduler,
            upload_script,
            local_path,
            remote_path,
            upload_protocol,
            monitor_job,
            execute_directory,
            timeout,
            download_directory,
        })
    }

    /// Path the script lives at on the cluster after upload.
    pub fn remote_script_path(&self) -> String {
        format!("{}/{}", self.remote_path, self.name)
    }

    pub fn unbounded(&self) -> bool {
        self.timeout.is_zero()
    }
}

fn parse_bool(job: &str, value: Option<&Value>, default: bool) -> Result<bool> {
    match value {
        None => Ok(default),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(Value::String(raw)) if raw.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(raw)) if raw.eq_ignore_ascii_case("false") => Ok(false),
        Some(other) => Err(LifecycleError::job(
            job,
            format!("expected a boolean option, got {other}"),
        )),
    }
}

fn parse_timeout(job: &str, value: Option<&Value>) -> Result<Duration> {
    match value {
        None => Ok(Duration::ZERO),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| LifecycleError::job(job, "timeout must be a whole number of seconds")),
        Some(Value::String(raw)) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| LifecycleError::job(job, "timeout must be a whole number of seconds")),
        Some(other) => Err(LifecycleError::job(
            job,
            format!("timeout must be a number of seconds, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_options_resolve_to_home_defaults() {
        let descriptor = JobDescriptor::from_options("run.sh", &json!({}), "rstaff").unwrap();

        assert!(descriptor.upload_script);
        assert!(descriptor.monitor_job);
        assert_eq!(descriptor.remote_path, "/home/rstaff");
        assert_eq!(descriptor.execute_directory, "/home/rstaff");
        assert_eq!(descriptor.upload_protocol, UploadProtocol::Sftp);
        assert_eq!(descriptor.scheduler, "cloudq");
        assert!(descriptor.unbounded());
        assert_eq!(descriptor.remote_script_path(), "/home/rstaff/run.sh");
        assert!(descriptor.local_path.ends_with("run.sh"));
    }

    #[test]
    fn overrides_are_honoured() {
        let descriptor = JobDescriptor::from_options(
            "sweep.sh",
            &json!({
                "upload_script": "false",
                "monitor_job": false,
                "remote_path": "/shared/scripts/",
                "upload_protocol": "webdav",
                "execute_directory": "/shared/run",
                "timeout": 3600,
                "download_directory": "/tmp/results",
                "scheduler": "slurm",
            }),
            "rstaff",
        )
        .unwrap();

        assert!(!descriptor.upload_script);
        assert!(!descriptor.monitor_job);
        assert_eq!(descriptor.remote_path, "/shared/scripts");
        assert_eq!(descriptor.upload_protocol, UploadProtocol::WebDav);
        assert_eq!(descriptor.timeout, Duration::from_secs(3600));
        assert_eq!(descriptor.scheduler, "slurm");
        assert!(!descriptor.unbounded());
    }

    #[test]
    fn malformed_booleans_are_rejected() {
        let err = JobDescriptor::from_options(
            "run.sh",
            &json!({"monitor_job": "yes please"}),
            "rstaff",
        )
        .unwrap_err();
        assert!(matches!(err, LifecycleError::Job { .. }));
    }

    #[test]
    fn unknown_upload_protocol_is_rejected() {
        let err =
            JobDescriptor::from_options("run.sh", &json!({"upload_protocol": "ftp"}), "rstaff")
                .unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn job_kind_defaults_to_script() {
        assert_eq!(
            JobKind::from_options("run.sh", &json!({})).unwrap(),
            JobKind::Script
        );
        assert_eq!(
            JobKind::from_options("sweep", &json!({"kind": "workflow"})).unwrap(),
            JobKind::Workflow
        );
        let err = JobKind::from_options("run.sh", &json!({"kind": "cron"})).unwrap_err();
        assert!(err.to_string().contains("cron"));
    }

    #[test]
    fn timeout_accepts_numeric_strings() {
        let descriptor =
            JobDescriptor::from_options("run.sh", &json!({"timeout": "600"}), "rstaff").unwrap();
        assert_eq!(descriptor.timeout, Duration::from_secs(600));
    }
}

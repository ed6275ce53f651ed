//! ---
//! cpilot_section: "05-job-execution"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Job script upload, submission, monitoring and artifact download."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use cpilot_common::{LifecycleError, Result};
use cpilot_sched::{CommandOutput, CommandRunner};

/// File movement and command execution against the environment's login node.
///
/// `as_runner` exists so callers holding `dyn RemoteTransport` can hand the
/// transport to seams that only want a [`CommandRunner`].
#[async_trait]
pub trait RemoteTransport: CommandRunner {
    fn as_runner(&self) -> &dyn CommandRunner;

    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    async fn download(&self, remote: &str, local: &Path) -> Result<()>;
}

const SSH_OPTIONS: &[&str] = &["-o", "StrictHostKeyChecking=no", "-o", "BatchMode=yes"];

/// Transport over the system `ssh`/`scp` binaries.
pub struct SshTransport {
    host: String,
    user: String,
    key_path: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: Option<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path,
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTIONS.iter().map(|s| (*s).to_owned()).collect();
        if let Some(key) = &self.key_path {
            args.push("-i".to_owned());
            args.push(key.display().to_string());
        }
        args
    }

    async fn invoke(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(%program, ?args, "invoking remote transport");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|err| LifecycleError::transport(format!("failed to run {program}: {err}")))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl CommandRunner for SshTransport {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut args = self.base_args();
        args.push(self.target());
        args.push(command.to_owned());
        self.invoke("ssh", &args).await
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn as_runner(&self) -> &dyn CommandRunner {
        self
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut args = self.base_args();
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.target(), remote));
        let output = self.invoke("scp", &args).await?;
        if output.exit_code != 0 {
            return Err(LifecycleError::transport(format!(
                "upload of {} failed: {}",
                local.display(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let mut args = self.base_args();
        args.push(format!("{}:{}", self.target(), remote));
        args.push(local.display().to_string());
        let output = self.invoke("scp", &args).await?;
        if output.exit_code != 0 {
            return Err(LifecycleError::transport(format!(
                "download of {remote} failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Script upload over the environment's WebDAV share.
pub struct WebDavClient {
    client: reqwest::Client,
    user_name: String,
    password: String,
}

impl WebDavClient {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            user_name: user_name.into(),
            password: password.into(),
        }
    }

    /// Upload a script into the shared directory, returning the name it was
    /// stored under. Scripts are always stored with a `.sh` extension.
    pub async fn put_script(&self, dns: &str, shared_dir: &str, local: &Path) -> Result<String> {
        let file_name = local
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                LifecycleError::validation(format!("{} has no file name", local.display()))
            })?;
        let stored = webdav_name(file_name);
        let body = tokio::fs::read(local).await?;

        let url = format!(
            "https://{}{}/{}",
            dns,
            shared_dir.trim_end_matches('/'),
            stored
        );
        debug!(%url, "uploading job script over webdav");
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.user_name, Some(&self.password))
            .body(body)
            .send()
            .await
            .map_err(|err| LifecycleError::transport(format!("webdav upload failed: {err}")))?;

        if !response.status().is_success() {
            return Err(LifecycleError::transport(format!(
                "webdav upload of {stored} was rejected with status {}",
                response.status()
            )));
        }
        Ok(stored)
    }
}

/// The share only executes `.sh` files, so the extension is appended when
/// the local name lacks it.
fn webdav_name(file_name: &str) -> String {
    if file_name.ends_with(".sh") {
        file_name.to_owned()
    } else {
        format!("{file_name}.sh")
    }
}

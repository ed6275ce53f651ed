//! ---
//! cpilot_section: "01-lifecycle-foundation"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Shared configuration, error, logging and manifest primitives."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::poll::PollPolicy;

fn default_cloud() -> String {
    "aws".to_owned()
}

fn default_scheduler() -> String {
    "cloudq".to_owned()
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("cpilot-run.manifest")
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_environment_name() -> String {
    "hpc-env".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_resource_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_resource_max_wait() -> Duration {
    Duration::from_secs(600)
}

fn default_environment_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_environment_max_wait() -> Duration {
    Duration::from_secs(2400)
}

fn default_job_running_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_job_provisioning_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_batch_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_warmup_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_warmup_max_wait() -> Duration {
    Duration::from_secs(180)
}

/// Primary configuration object for a cluster-pilot run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "CPILOT_CONFIG";

    /// Load configuration from disk, respecting the `CPILOT_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.user.name.trim().is_empty() {
            return Err(anyhow!("[user] name must not be empty"));
        }
        if self.environment.name.trim().is_empty() {
            return Err(anyhow!("[environment] name must not be empty"));
        }
        for (job, options) in &self.jobs.scripts {
            if !options.is_object() {
                return Err(anyhow!(
                    "job '{}' options must be a table of settings",
                    job
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Cloud discriminator, resolved against the backend registry at startup.
    #[serde(default = "default_cloud")]
    pub cloud: String,
    /// Scheduler discriminator, resolved against the adapter registry.
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cloud: default_cloud(),
            scheduler: default_scheduler(),
            manifest_path: default_manifest_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
    /// Private key used for script upload and remote commands over ssh.
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
}

/// Settings for the control resource stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Override for the generated resource name.
    #[serde(default)]
    pub name: Option<String>,
    /// Known control plane endpoint, for runs against existing resources.
    /// Takes precedence over whatever the run manifest recorded.
    #[serde(default)]
    pub dns: Option<String>,
    /// Provider template describing the control resource shape.
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Zone qualifier for instance-style clouds.
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            name: None,
            dns: None,
            template_path: None,
            region: default_region(),
            zone: None,
            parameters: IndexMap::new(),
        }
    }
}

/// Settings for the environment stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Base name; a 4-character suffix is appended per run.
    #[serde(default = "default_environment_name")]
    pub name: String,
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: default_environment_name(),
            template_path: None,
            parameters: IndexMap::new(),
        }
    }
}

/// Jobs to run during the run-jobs stage, keyed by script name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub scripts: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Polling cadences and ceilings, tuned against real provisioning times.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_resource_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub resource_interval: Duration,
    #[serde(default = "default_resource_max_wait")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub resource_max_wait: Duration,
    #[serde(default = "default_environment_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub environment_interval: Duration,
    #[serde(default = "default_environment_max_wait")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub environment_max_wait: Duration,
    #[serde(default = "default_job_running_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub job_running_interval: Duration,
    #[serde(default = "default_job_provisioning_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub job_provisioning_interval: Duration,
    #[serde(default = "default_batch_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub batch_interval: Duration,
    #[serde(default = "default_warmup_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub warmup_interval: Duration,
    #[serde(default = "default_warmup_max_wait")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub warmup_max_wait: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            resource_interval: default_resource_interval(),
            resource_max_wait: default_resource_max_wait(),
            environment_interval: default_environment_interval(),
            environment_max_wait: default_environment_max_wait(),
            job_running_interval: default_job_running_interval(),
            job_provisioning_interval: default_job_provisioning_interval(),
            batch_interval: default_batch_interval(),
            warmup_interval: default_warmup_interval(),
            warmup_max_wait: default_warmup_max_wait(),
        }
    }
}

impl PollingConfig {
    pub fn resource_policy(&self) -> PollPolicy {
        PollPolicy::bounded(self.resource_interval, self.resource_max_wait)
    }

    pub fn environment_policy(&self) -> PollPolicy {
        PollPolicy::bounded(self.environment_interval, self.environment_max_wait)
    }

    pub fn warmup_policy(&self) -> PollPolicy {
        PollPolicy::bounded(self.warmup_interval, self.warmup_max_wait)
    }
}

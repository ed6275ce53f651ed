//! ---
//! cpilot_section: "07-cli"
//! cpilot_subsection: "binary"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Binary entrypoint for the cpilot lifecycle utility."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use cpilot_common::config::AppConfig;
use cpilot_common::logging::init_tracing;
use cpilot_core::{Orchestrator, StageSelection};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Creates, uses and tears down remotely managed HPC environments",
    long_about = None
)]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long = "all", help = "Run the whole pipeline: create control resources, \
        create an environment, run the configured jobs, then tear everything down")]
    all: bool,

    #[arg(long = "nd", help = "With --all, skip the teardown stages")]
    no_delete: bool,

    #[arg(long = "cc", help = "Create new control resources")]
    create_control: bool,

    #[arg(long = "ce", help = "Create a new environment")]
    create_environment: bool,

    #[arg(long = "rj", help = "Run the jobs listed in the configuration file")]
    run_jobs: bool,

    #[arg(long = "de", help = "Delete the environment")]
    delete_environment: bool,

    #[arg(long = "dc", help = "Delete the control resources")]
    delete_control: bool,

    #[arg(long = "dff", help = "Delete whatever the run manifest records")]
    delete_from_manifest: bool,

    #[arg(short = 'e', long, value_name = "NAME", help = "Full (suffixed) environment name to use")]
    environment_name: Option<String>,

    #[arg(long, value_name = "NAME", help = "Name of the control resources to delete")]
    control_resource_name: Option<String>,

    #[arg(
        short = 'd',
        long,
        value_name = "DNS",
        help = "DNS name of an existing control plane, instead of the manifest's"
    )]
    domain_name: Option<String>,

    #[arg(
        short = 'j',
        long,
        value_name = "JSON",
        help = "JSON object of job scripts, replacing [jobs.scripts] from the configuration"
    )]
    jobs: Option<String>,

    #[arg(short, long, value_name = "REGION", help = "Region the control resources live in")]
    region: Option<String>,

    #[arg(short, long, value_name = "PROFILE", help = "Cloud credential profile to use")]
    profile: Option<String>,
}

impl Cli {
    fn selection(&self) -> StageSelection {
        StageSelection {
            all: self.all,
            no_delete: self.no_delete,
            create_control: self.create_control,
            create_environment: self.create_environment,
            run_jobs: self.run_jobs,
            delete_environment: self.delete_environment,
            delete_control: self.delete_control,
            delete_from_manifest: self.delete_from_manifest,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let stages = cli.selection().plan();
    if stages.is_empty() {
        bail!("no stages selected; pass --all or one of --cc --ce --rj --de --dc --dff");
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("cpilot.toml"));
    candidates.push(PathBuf::from("configs/cpilot.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;

    if let Some(name) = cli.environment_name {
        config.environment.name = name;
    }
    if let Some(name) = cli.control_resource_name {
        config.control.name = Some(name);
    }
    if let Some(region) = cli.region {
        config.control.region = region;
    }
    if let Some(dns) = cli.domain_name {
        config.control.dns = Some(dns);
    }
    if let Some(raw) = &cli.jobs {
        config.jobs.scripts = serde_json::from_str(raw)
            .context("--jobs must be a JSON object mapping script names to option tables")?;
    }
    if let Some(profile) = &cli.profile {
        // The provider CLIs this process spawns pick the profile up from
        // their environment.
        std::env::set_var("AWS_PROFILE", profile);
        std::env::set_var("CLOUDSDK_ACTIVE_CONFIG_NAME", profile);
    }

    init_tracing("cpilot", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        cloud = %config.general.cloud,
        scheduler = %config.general.scheduler,
        stages = %stages.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
        "starting lifecycle run"
    );

    let orchestrator = Orchestrator::from_config(config)?;
    orchestrator.run(&stages).await?;
    info!("all requested stages finished");
    Ok(())
}

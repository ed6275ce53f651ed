//! ---
//! cpilot_section: "01-lifecycle-foundation"
//! cpilot_subsection: "integration-tests"
//! cpilot_type: "source"
//! cpilot_scope: "test"
//! cpilot_description: "End-to-end checks of the configuration loading surface."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use tempfile::tempdir;

use cpilot_common::config::AppConfig;

const FULL_CONFIG: &str = r#"
[general]
cloud = "gcp"
scheduler = "slurm"
manifest_path = "state/run.manifest"

[user]
name = "rstaff"
password = "hunter2"
ssh_key_path = "/home/rstaff/.ssh/id_ed25519"

[control]
dns = "ctl.lab.example.net"
region = "us-east1"
zone = "us-east1-b"

[control.parameters]
project = "hpc-lab"
db_read_capacity = "20"

[environment]
name = "bio-sim"
template_path = "templates/three-node.json"

[jobs.scripts."run.sh"]
remote_path = "/mnt/shared"
monitor_job = false
timeout = 900

[polling]
resource_interval = 5
resource_max_wait = 30
"#;

#[test]
fn a_full_document_round_trips_through_the_loader() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cpilot.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let loaded = AppConfig::load_with_source(&[path.clone()]).unwrap();
    assert_eq!(loaded.source, path);

    let config = loaded.config;
    assert_eq!(config.general.cloud, "gcp");
    assert_eq!(config.general.scheduler, "slurm");
    assert_eq!(config.user.name, "rstaff");
    assert_eq!(config.control.dns.as_deref(), Some("ctl.lab.example.net"));
    assert_eq!(config.control.zone.as_deref(), Some("us-east1-b"));
    assert_eq!(
        config.control.parameters.get("project").map(String::as_str),
        Some("hpc-lab")
    );
    assert_eq!(config.environment.name, "bio-sim");
    assert!(config.jobs.scripts.contains_key("run.sh"));
}

#[test]
fn overridden_polling_values_reach_the_policies() {
    let config: AppConfig = FULL_CONFIG.parse().unwrap();

    let policy = config.polling.resource_policy();
    assert_eq!(policy.interval, Duration::from_secs(5));
    assert_eq!(policy.max_wait, Some(Duration::from_secs(30)));

    // Sections left out of the document keep the stock cadence.
    let environment = config.polling.environment_policy();
    assert_eq!(environment.interval, Duration::from_secs(120));
    assert_eq!(environment.max_wait, Some(Duration::from_secs(2400)));
}

#[test]
fn the_first_existing_candidate_is_picked() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.toml");
    let present = dir.path().join("fallback.toml");
    fs::write(&present, FULL_CONFIG).unwrap();

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
    assert_eq!(loaded.source, present);
}

#[test]
fn validation_failures_surface_through_the_loader() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[user]\nname = \"\"\n").unwrap();

    let err = AppConfig::load_with_source(&[path]).unwrap_err();
    assert!(err.to_string().contains("[user] name"));
}

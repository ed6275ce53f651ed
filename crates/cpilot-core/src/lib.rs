//! ---
//! cpilot_section: "06-orchestration"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Stage orchestration for control resources, environments and jobs."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
//! The lifecycle pipeline: provision control resources, spin an environment
//! up on them, run the configured jobs, and tear everything down again, with
//! every created identifier recorded in a run manifest for crash recovery.

pub mod control;
pub mod environment;
pub mod orchestrator;
pub mod stages;

pub use control::{ControlResourceLifecycle, ControlResources};
pub use environment::{ClusterDescriptorBuilder, EnvironmentLifecycle, TemplateDescriptorBuilder};
pub use orchestrator::Orchestrator;
pub use stages::{Stage, StageSelection};

/// Short random suffix appended to generated resource and environment names
/// so repeated runs never collide.
pub(crate) fn short_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..4].to_owned()
}

//! ---
//! cpilot_section: "06-orchestration"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Stage orchestration for control resources, environments and jobs."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::fmt;

/// One step of the lifecycle pipeline, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CreateControl,
    CreateEnvironment,
    RunJobs,
    DeleteEnvironment,
    DeleteControl,
    DeleteFromManifest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateControl => "create-control",
            Self::CreateEnvironment => "create-environment",
            Self::RunJobs => "run-jobs",
            Self::DeleteEnvironment => "delete-environment",
            Self::DeleteControl => "delete-control",
            Self::DeleteFromManifest => "delete-from-manifest",
        };
        f.write_str(name)
    }
}

/// Which stages the invocation asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageSelection {
    pub all: bool,
    /// With `all`, stop after the jobs instead of tearing down.
    pub no_delete: bool,
    pub create_control: bool,
    pub create_environment: bool,
    pub run_jobs: bool,
    pub delete_environment: bool,
    pub delete_control: bool,
    pub delete_from_manifest: bool,
}

impl StageSelection {
    /// Expand the selection into the ordered stage list. Individual flags
    /// always execute in canonical order regardless of how they were given.
    pub fn plan(&self) -> Vec<Stage> {
        if self.all {
            let mut stages = vec![Stage::CreateControl, Stage::CreateEnvironment, Stage::RunJobs];
            if !self.no_delete {
                stages.push(Stage::DeleteEnvironment);
                stages.push(Stage::DeleteControl);
            }
            return stages;
        }

        let mut stages = Vec::new();
        if self.create_control {
            stages.push(Stage::CreateControl);
        }
        if self.create_environment {
            stages.push(Stage::CreateEnvironment);
        }
        if self.run_jobs {
            stages.push(Stage::RunJobs);
        }
        if self.delete_environment {
            stages.push(Stage::DeleteEnvironment);
        }
        if self.delete_control {
            stages.push(Stage::DeleteControl);
        }
        if self.delete_from_manifest {
            stages.push(Stage::DeleteFromManifest);
        }
        stages
    }
}

//! ---
//! cpilot_section: "04-scheduling-jobs"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Scheduler adapters for job submission and status."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use crate::{HeaderRequest, SchedulerAdapter, SchedulerCommands};
use cpilot_common::Result;

/// Header and command adapter for Slurm-managed environments.
pub struct Slurm;

impl SchedulerAdapter for Slurm {
    fn kind(&self) -> &'static str {
        "slurm"
    }

    fn commands(&self) -> SchedulerCommands {
        SchedulerCommands {
            submit: "sbatch",
            cancel: "scancel",
            monitor: "squeue",
        }
    }

    // Node and per-node task counts are omitted: with burst capacity the
    // number of nodes actually granted is not known at submission time.
    fn parent_header(&self, request: &HeaderRequest) -> Result<String> {
        Ok(format!(
            "#!/bin/bash\n#SBATCH --time={}\n",
            request.wall_time
        ))
    }

    fn child_header(&self, request: &HeaderRequest) -> Result<String> {
        Ok(format!(
            "#!/bin/bash\n#SBATCH -N {}\n#SBATCH --job-name={}\n#SBATCH --time={}\n#SBATCH -D {}\n",
            request.nodes, request.job_label, request.wall_time, request.shared_dir
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HeaderRequest {
        HeaderRequest {
            nodes: 4,
            cores: 16,
            wall_time: "02:00:00".to_owned(),
            job_label: "sweep-a".to_owned(),
            shared_dir: "/shared/run".to_owned(),
        }
    }

    #[test]
    fn parent_header_only_pins_wall_time() {
        let header = Slurm.parent_header(&request()).unwrap();
        assert_eq!(header, "#!/bin/bash\n#SBATCH --time=02:00:00\n");
    }

    #[test]
    fn child_header_pins_nodes_name_and_workdir() {
        let header = Slurm.child_header(&request()).unwrap();
        assert!(header.contains("#SBATCH -N 4\n"));
        assert!(header.contains("#SBATCH --job-name=sweep-a\n"));
        assert!(header.contains("#SBATCH -D /shared/run\n"));
        assert!(!header.contains("ntasks-per-node"));
    }

    #[test]
    fn command_triple() {
        let commands = Slurm.commands();
        assert_eq!(commands.submit, "sbatch");
        assert_eq!(commands.cancel, "scancel");
        assert_eq!(commands.monitor, "squeue");
    }
}

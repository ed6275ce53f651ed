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

/// Header and command adapter for Torque-managed environments.
pub struct Torque;

impl SchedulerAdapter for Torque {
    fn kind(&self) -> &'static str {
        "torque"
    }

    fn commands(&self) -> SchedulerCommands {
        SchedulerCommands {
            submit: "qsub",
            cancel: "qdel",
            monitor: "qstat",
        }
    }

    fn parent_header(&self, request: &HeaderRequest) -> Result<String> {
        Ok(format!(
            "#!/bin/bash\n#PBS -l nodes={}:ppn={}\n#PBS -l walltime={}\n",
            request.nodes, request.cores, request.wall_time
        ))
    }

    fn child_header(&self, request: &HeaderRequest) -> Result<String> {
        self.parent_header(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_nodes_cores_and_walltime() {
        let request = HeaderRequest {
            nodes: 2,
            cores: 8,
            wall_time: "01:30:00".to_owned(),
            job_label: "sweep-b".to_owned(),
            shared_dir: "/shared/run".to_owned(),
        };
        let header = Torque.parent_header(&request).unwrap();
        assert_eq!(
            header,
            "#!/bin/bash\n#PBS -l nodes=2:ppn=8\n#PBS -l walltime=01:30:00\n"
        );
        assert_eq!(Torque.child_header(&request).unwrap(), header);
    }

    #[test]
    fn command_triple() {
        let commands = Torque.commands();
        assert_eq!(commands.submit, "qsub");
        assert_eq!(commands.cancel, "qdel");
        assert_eq!(commands.monitor, "qstat");
    }
}

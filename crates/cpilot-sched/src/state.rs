//! ---
//! cpilot_section: "04-scheduling-jobs"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Scheduler adapters for job submission and status."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::fmt;

/// Job states reported by the bundled scheduler.
///
/// Only the five named states are meaningful; anything else is an internal
/// provisioning state (instances being launched, scheduler warming up) and is
/// polled at a slower cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Error,
    Killed,
    Provisioning(String),
}

impl JobState {
    /// Classify the state token at the end of a scheduler status line.
    pub fn parse(token: &str) -> Self {
        match token {
            "Submitted" => Self::Submitted,
            "Running" => Self::Running,
            "Completed" => Self::Completed,
            "Error" => Self::Error,
            "Killed" => Self::Killed,
            other => Self::Provisioning(other.to_owned()),
        }
    }

    /// Completed, Error and Killed end the monitoring loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Killed)
    }

    /// States polled at the fast cadence.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "Submitted"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Error => write!(f, "Error"),
            Self::Killed => write!(f, "Killed"),
            Self::Provisioning(raw) => write!(f, "{raw}"),
        }
    }
}

//! ---
//! cpilot_section: "01-lifecycle-foundation"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Shared configuration, error, logging and manifest primitives."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cadence and ceiling for a bounded polling loop.
///
/// A `max_wait` of `None` means the loop never gives up on its own; the
/// caller decides when to stop. The production defaults live next to the
/// loops that use them and were tuned against real provisioning times, so
/// they are injected rather than hard-coded to let tests compress the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Option<Duration>,
}

impl PollPolicy {
    pub const fn bounded(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            max_wait: Some(max_wait),
        }
    }

    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_wait: None,
        }
    }

    /// True once the accumulated wait has reached the ceiling.
    pub fn expired(&self, waited: Duration) -> bool {
        match self.max_wait {
            Some(ceiling) => waited >= ceiling,
            None => false,
        }
    }
}

//! ---
//! cpilot_section: "01-lifecycle-foundation"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Shared configuration, error, logging and manifest primitives."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod poll;

pub use config::AppConfig;
pub use error::{LifecycleError, Result};
pub use manifest::RunManifest;
pub use poll::PollPolicy;

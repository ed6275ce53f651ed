//! ---
//! cpilot_section: "05-job-execution"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "Job script upload, submission, monitoring and artifact download."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
//! Job execution against a spun-up environment: scripts are uploaded to the
//! login node, submitted through a scheduler adapter, watched until they
//! reach a terminal state and have their output artifacts pulled back down.

pub mod batch;
pub mod descriptor;
pub mod lifecycle;
pub mod transport;
pub mod workflow;

pub use batch::{BatchEntry, BatchReport};
pub use descriptor::{JobDescriptor, JobKind, UploadProtocol};
pub use lifecycle::{ssh_factory, JobLifecycle, JobOutcome, JobSession, TransportFactory};
pub use transport::{RemoteTransport, SshTransport, WebDavClient};
pub use workflow::{run_to_completion, Workflow};

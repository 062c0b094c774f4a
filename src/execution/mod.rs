//! Execution status model and the execution poller.
//!
//! Both the deployment update state machine and the snapshot restore
//! orchestrator gate on [`ExecutionPoller`]; the former treats a missed
//! deadline as fatal, the latter polls in tolerant mode.

mod poller;
mod types;

pub use poller::{ExecutionPoller, PollMode, DEFAULT_POLL_INTERVAL};
pub use types::ExecutionStatus;

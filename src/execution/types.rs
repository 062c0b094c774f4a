//! Execution status model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not picked up yet.
    Pending,
    /// Running.
    Started,
    /// Waiting for its scheduled time.
    Scheduled,
    /// Queued behind other executions.
    Queued,
    /// Cancellation requested.
    Cancelling,
    /// Forced cancellation requested.
    ForceCancelling,
    /// Finished successfully.
    Terminated,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Cancelled,
}

impl ExecutionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Started,
        Self::Scheduled,
        Self::Queued,
        Self::Cancelling,
        Self::ForceCancelling,
        Self::Terminated,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true once the execution cannot change anymore.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed | Self::Cancelled)
    }

    /// Returns true for the successful terminal status.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns true for statuses that only make sense while a worker
    /// is attached to the execution.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Started | Self::Cancelling | Self::ForceCancelling
        )
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Cancelling => "cancelling",
            Self::ForceCancelling => "force_cancelling",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

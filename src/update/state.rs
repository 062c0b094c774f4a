//! Deployment update records and their state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use super::step::{EntityChange, NodeModificationType};
use crate::error::{Result, UpdateError};

/// Name of the workflow dispatched by default.
pub const DEFAULT_UPDATE_WORKFLOW: &str = "update";

/// State of a deployment update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// Computing and persisting the diff.
    Updating,
    /// Waiting for the update workflow.
    ExecutingWorkflow,
    /// Applying side effects and persisting the new topology.
    Finalizing,
    /// Done.
    Successful,
    /// Gave up.
    Failed,
}

impl UpdateState {
    const fn rank(self) -> u8 {
        match self {
            Self::Updating => 0,
            Self::ExecutingWorkflow => 1,
            Self::Finalizing => 2,
            Self::Successful | Self::Failed => 3,
        }
    }

    /// Returns true for the immutable end states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    /// Returns true if `next` directly follows `self`.
    ///
    /// Every non-terminal state may fail; otherwise states advance one at
    /// a time and never go back.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Updating => "updating",
            Self::ExecutingWorkflow => "executing_workflow",
            Self::Finalizing => "finalizing",
            Self::Successful => "successful",
            Self::Failed => "failed",
        })
    }
}

/// Phase marker of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePhase {
    /// Diff computed, workflow dispatched.
    #[serde(rename = "initiate")]
    Initial,
    /// Side effects applied.
    #[serde(rename = "finalize")]
    Final,
}

/// One update of a deployment's topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    /// Update id.
    pub id: String,
    /// Deployment being updated.
    pub deployment_id: String,
    /// Target blueprint revision.
    pub blueprint_id: String,
    /// Current state.
    pub state: UpdateState,
    /// Current phase.
    pub phase: UpdatePhase,
    /// Steps, in application order.
    #[serde(default)]
    pub steps: Vec<EntityChange>,
    /// Ripple classification by node id.
    #[serde(default)]
    pub modified_nodes: BTreeMap<String, NodeModificationType>,
    /// Fingerprint of the topology before the update.
    #[serde(default)]
    pub old_fingerprint: String,
    /// Fingerprint of the target topology.
    #[serde(default)]
    pub new_fingerprint: String,
    /// Dispatched workflow.
    pub workflow_id: String,
    /// Execution of the workflow, once dispatched.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentUpdate {
    /// Creates an update in the `Updating` state.
    #[must_use]
    pub fn new(deployment_id: &str, blueprint_id: &str, workflow_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment_id.to_string(),
            blueprint_id: blueprint_id.to_string(),
            state: UpdateState::Updating,
            phase: UpdatePhase::Initial,
            steps: Vec::new(),
            modified_nodes: BTreeMap::new(),
            old_fingerprint: String::new(),
            new_fingerprint: String::new(),
            workflow_id: workflow_id.to_string(),
            execution_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the update to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `next` does not directly follow the
    /// current state, including any move out of a terminal state.
    pub fn transition(&mut self, next: UpdateState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        debug!("Update {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        if next == UpdateState::Finalizing {
            self.phase = UpdatePhase::Final;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves the update to `Failed` with the given reason.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the update already reached a terminal
    /// state.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(UpdateState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut update = DeploymentUpdate::new("dep", "bp-v2", DEFAULT_UPDATE_WORKFLOW);
        assert_eq!(update.phase, UpdatePhase::Initial);

        update.transition(UpdateState::ExecutingWorkflow).unwrap();
        update.transition(UpdateState::Finalizing).unwrap();
        assert_eq!(update.phase, UpdatePhase::Final);
        update.transition(UpdateState::Successful).unwrap();

        assert!(update.fail("late").is_err());
        assert_eq!(update.state, UpdateState::Successful);
        assert!(update.error.is_none());
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        let mut update = DeploymentUpdate::new("dep", "bp", DEFAULT_UPDATE_WORKFLOW);
        assert!(update.transition(UpdateState::Finalizing).is_err());
        assert!(update.transition(UpdateState::Successful).is_err());

        update.transition(UpdateState::ExecutingWorkflow).unwrap();
        assert!(update.transition(UpdateState::Updating).is_err());
    }

    #[test]
    fn test_failed_is_immutable() {
        let mut update = DeploymentUpdate::new("dep", "bp", DEFAULT_UPDATE_WORKFLOW);
        update.fail("boom").unwrap();
        assert_eq!(update.state, UpdateState::Failed);
        assert_eq!(update.error.as_deref(), Some("boom"));

        for next in [
            UpdateState::Updating,
            UpdateState::ExecutingWorkflow,
            UpdateState::Finalizing,
            UpdateState::Successful,
            UpdateState::Failed,
        ] {
            assert!(update.transition(next).is_err());
        }
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&UpdatePhase::Initial).unwrap(), "\"initiate\"");
        assert_eq!(serde_json::to_string(&UpdatePhase::Final).unwrap(), "\"finalize\"");
    }
}

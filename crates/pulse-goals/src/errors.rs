//! Goal error types.

use pulse_core::GoalId;
use thiserror::Error;

use crate::types::GoalStatus;

/// A transition the lifecycle does not allow from the goal's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {attempted_event} to goal {goal_id} while it is {from}")]
pub struct InvalidTransition {
    /// Goal the event was applied to.
    pub goal_id: GoalId,
    /// Status at the time of the attempt.
    pub from: GoalStatus,
    /// Name of the rejected event (`updateProgress`, `resume`, ...).
    pub attempted_event: &'static str,
}

/// Errors from the goal persistence seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No goal with this id.
    #[error("goal not found: {0}")]
    NotFound(GoalId),

    /// The stored goal changed since it was loaded.
    #[error("version conflict on goal {goal_id}: expected {expected}, found {found}")]
    Conflict {
        /// Goal being saved.
        goal_id: GoalId,
        /// Version the caller loaded.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// Backend failure.
    #[error("goal store failure: {0}")]
    Backend(String),
}

/// Errors from goal operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GoalError {
    /// Lifecycle rejected the event; nothing changed.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Progress value (or supplied percentage) is not a finite number.
    #[error("invalid progress value: {value}")]
    InvalidProgress {
        /// Offending value.
        value: f64,
    },

    /// Goal does not exist or belongs to another user.
    #[error("goal not found: {0}")]
    NotFound(GoalId),

    /// Concurrent writers kept winning; gave up.
    #[error("goal {0} was modified concurrently")]
    Conflict(GoalId),

    /// Persistence failure.
    #[error("goal store failure: {0}")]
    Store(String),
}

impl GoalError {
    /// Machine-readable code for error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::InvalidProgress { .. } => "INVALID_PROGRESS",
            Self::NotFound(_) => "GOAL_NOT_FOUND",
            Self::Conflict(_) => "GOAL_CONFLICT",
            Self::Store(_) => "GOAL_STORE_ERROR",
        }
    }
}

impl From<StoreError> for GoalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Conflict { goal_id, .. } => Self::Conflict(goal_id),
            StoreError::Backend(msg) => Self::Store(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = InvalidTransition {
            goal_id: GoalId::from("goal_1"),
            from: GoalStatus::Completed,
            attempted_event: "complete",
        };
        assert_eq!(
            err.to_string(),
            "cannot apply complete to goal goal_1 while it is completed"
        );
    }

    #[test]
    fn store_errors_map_to_goal_errors() {
        let id = GoalId::from("goal_1");
        assert_eq!(
            GoalError::from(StoreError::NotFound(id.clone())),
            GoalError::NotFound(id.clone())
        );
        assert_eq!(
            GoalError::from(StoreError::Conflict {
                goal_id: id.clone(),
                expected: 1,
                found: 2
            }),
            GoalError::Conflict(id)
        );
    }

    #[test]
    fn codes() {
        assert_eq!(GoalError::InvalidProgress { value: f64::NAN }.code(), "INVALID_PROGRESS");
        assert_eq!(GoalError::Store("disk".into()).code(), "GOAL_STORE_ERROR");
    }
}

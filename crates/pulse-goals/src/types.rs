//! Goal entity types.

use std::fmt;

use chrono::{DateTime, Utc};
use pulse_core::{GoalId, UserId};
use serde::{Deserialize, Serialize};

/// How progress on a goal is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalType {
    /// Reach a numeric target; percentage derives from current / target.
    Target,
    /// Keep up a recurring behaviour; percentage is reported by the caller.
    Habit,
    /// Pass a set of checkpoints; percentage is reported by the caller.
    Milestone,
}

/// Lifecycle state of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    /// Accepting progress.
    Active,
    /// Temporarily on hold.
    Paused,
    /// Reached, terminal.
    Completed,
    /// Abandoned by the user, terminal.
    Cancelled,
    /// Missed, terminal.
    Failed,
}

impl GoalStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the goal is aiming for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalTarget {
    /// Numeric target (e.g. `10000` steps).
    pub value: f64,
    /// Unit label (e.g. `"steps"`).
    pub unit: String,
}

/// When the goal runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeframe {
    /// Start of the goal period.
    pub start: DateTime<Utc>,
    /// Optional deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// A recorded checkpoint on the way to the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    /// Progress value when the milestone was recorded.
    pub value: f64,
    /// Percentage at that moment.
    pub percentage: u8,
    /// Free-form note supplied with the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When it was recorded.
    pub achieved_at: DateTime<Utc>,
}

/// Progress tracking block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalProgress {
    /// Latest reported value.
    pub current: f64,
    /// Completion percentage, always within `0..=100`.
    pub percentage: u8,
    /// When progress last changed.
    pub last_updated: DateTime<Utc>,
    /// Recorded checkpoints, oldest first.
    pub milestones: Vec<Milestone>,
}

/// A user goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    /// Goal identifier.
    pub id: GoalId,
    /// Owner.
    pub user_id: UserId,
    /// Short title shown to the user.
    pub title: String,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Measurement kind.
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    /// Target specification.
    pub target: GoalTarget,
    /// Goal period.
    pub timeframe: Timeframe,
    /// Lifecycle state.
    pub status: GoalStatus,
    /// Why the goal was paused, while paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,
    /// When the goal completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Note supplied on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_note: Option<String>,
    /// Reason supplied on cancellation or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
    /// Progress block.
    pub progress: GoalProgress,
    /// Optimistic concurrency version, bumped by the store on save.
    #[serde(default)]
    pub version: u64,
}

impl Goal {
    /// A fresh active goal with no progress.
    pub fn new(
        user_id: UserId,
        title: impl Into<String>,
        goal_type: GoalType,
        target: GoalTarget,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GoalId::generate(),
            user_id,
            title: title.into(),
            description: None,
            goal_type,
            target,
            timeframe,
            status: GoalStatus::Active,
            paused_reason: None,
            completed_at: None,
            completion_note: None,
            closed_reason: None,
            progress: GoalProgress {
                current: 0.0,
                percentage: 0,
                last_updated: now,
                milestones: Vec::new(),
            },
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn new_goal_is_active_and_empty() {
        let goal = Goal::new(
            "u1".into(),
            "Run 65 km",
            GoalType::Target,
            GoalTarget {
                value: 65.0,
                unit: "km".into(),
            },
            Timeframe {
                start: now(),
                end: None,
            },
            now(),
        );
        assert_eq!(goal.status, GoalStatus::Active);
        assert_eq!(goal.progress.percentage, 0);
        assert!(goal.progress.milestones.is_empty());
        assert_eq!(goal.version, 0);
    }

    #[test]
    fn terminal_states() {
        assert!(!GoalStatus::Active.is_terminal());
        assert!(!GoalStatus::Paused.is_terminal());
        assert!(GoalStatus::Completed.is_terminal());
        assert!(GoalStatus::Cancelled.is_terminal());
        assert!(GoalStatus::Failed.is_terminal());
    }

    #[test]
    fn wire_format() {
        let goal = Goal::new(
            "u1".into(),
            "Meditate",
            GoalType::Habit,
            GoalTarget {
                value: 30.0,
                unit: "days".into(),
            },
            Timeframe {
                start: now(),
                end: None,
            },
            now(),
        );
        let json = serde_json::to_value(&goal).unwrap();
        assert_eq!(json["type"], "habit");
        assert_eq!(json["status"], "active");
        assert_eq!(json["userId"], "u1");
        assert!(json["progress"]["lastUpdated"].is_string());
        assert!(json.get("pausedReason").is_none());
    }
}

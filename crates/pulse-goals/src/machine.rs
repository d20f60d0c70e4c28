//! Goal lifecycle transitions.
//!
//! ```text
//!            pause             complete / progress >= 100%
//!   active ─────────► paused   active|paused ─────────► completed
//!     ▲                 │
//!     └──── resume ─────┘      non-terminal ── cancel ─► cancelled
//!                              non-terminal ── fail ───► failed
//! ```
//!
//! [`apply_goal_event`] is pure: it reads the current goal and returns the
//! next one together with the events describing the change, or an error and
//! nothing else. Persisting and publishing are the caller's job.

use chrono::{DateTime, Utc};
use pulse_core::DomainEvent;
use pulse_core::events::names;
use serde_json::{Value, json};

use crate::errors::{GoalError, InvalidTransition};
use crate::progress::{MilestonePolicy, clamp_percentage, percentage};
use crate::types::{Goal, GoalStatus, GoalType, Milestone};

/// An input to the goal lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum GoalEvent {
    /// New progress value. `percentage` is only read for habit and
    /// milestone goals; target goals derive it from the value.
    UpdateProgress {
        /// Current value.
        value: f64,
        /// Caller-reported percentage.
        percentage: Option<f64>,
        /// Note recorded with a milestone.
        note: Option<String>,
    },
    /// Put the goal on hold.
    Pause {
        /// Why.
        reason: Option<String>,
    },
    /// Take the goal off hold.
    Resume,
    /// Mark the goal reached.
    Complete {
        /// Closing note.
        note: Option<String>,
    },
    /// Abandon the goal.
    Cancel {
        /// Why.
        reason: Option<String>,
    },
    /// Mark the goal missed.
    Fail {
        /// Why.
        reason: Option<String>,
    },
}

impl GoalEvent {
    /// Event name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateProgress { .. } => "updateProgress",
            Self::Pause { .. } => "pause",
            Self::Resume => "resume",
            Self::Complete { .. } => "complete",
            Self::Cancel { .. } => "cancel",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Inputs a transition needs besides the goal and the event.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// Timestamp stamped on the goal and on emitted events.
    pub now: DateTime<Utc>,
    /// Automatic milestone rule.
    pub milestones: &'a MilestonePolicy,
}

/// Result of an accepted event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Goal after the event. `version` is untouched; the store bumps it.
    pub goal: Goal,
    /// Events to publish, in order, to the owner's channel.
    pub events: Vec<DomainEvent>,
}

/// Apply `event` to `goal`.
pub fn apply_goal_event(
    goal: &Goal,
    event: &GoalEvent,
    ctx: &TransitionContext<'_>,
) -> Result<Transition, GoalError> {
    let reject = || {
        GoalError::from(InvalidTransition {
            goal_id: goal.id.clone(),
            from: goal.status,
            attempted_event: event.name(),
        })
    };

    match (goal.status, event) {
        (
            GoalStatus::Active,
            GoalEvent::UpdateProgress {
                value,
                percentage,
                note,
            },
        ) => update_progress(goal, *value, *percentage, note.as_deref(), ctx),

        (GoalStatus::Active, GoalEvent::Pause { reason }) => {
            let mut next = goal.clone();
            next.status = GoalStatus::Paused;
            next.paused_reason.clone_from(reason);
            let payload = json!({
                "goalId": goal.id,
                "reason": reason,
            });
            Ok(single(next, names::GOAL_PAUSED, payload, ctx.now))
        }

        (GoalStatus::Paused, GoalEvent::Resume) => {
            let mut next = goal.clone();
            next.status = GoalStatus::Active;
            next.paused_reason = None;
            let payload = json!({ "goalId": goal.id });
            Ok(single(next, names::GOAL_RESUMED, payload, ctx.now))
        }

        (GoalStatus::Active | GoalStatus::Paused, GoalEvent::Complete { note }) => {
            let mut next = goal.clone();
            next.status = GoalStatus::Completed;
            next.paused_reason = None;
            next.completed_at = Some(ctx.now);
            next.completion_note.clone_from(note);
            let payload = completed_payload(&next);
            Ok(single(next, names::GOAL_COMPLETED, payload, ctx.now))
        }

        (status, GoalEvent::Cancel { reason }) if !status.is_terminal() => Ok(close(
            goal,
            GoalStatus::Cancelled,
            names::GOAL_CANCELLED,
            reason.as_deref(),
            ctx.now,
        )),

        (status, GoalEvent::Fail { reason }) if !status.is_terminal() => Ok(close(
            goal,
            GoalStatus::Failed,
            names::GOAL_FAILED,
            reason.as_deref(),
            ctx.now,
        )),

        _ => Err(reject()),
    }
}

fn update_progress(
    goal: &Goal,
    value: f64,
    supplied: Option<f64>,
    note: Option<&str>,
    ctx: &TransitionContext<'_>,
) -> Result<Transition, GoalError> {
    if !value.is_finite() {
        return Err(GoalError::InvalidProgress { value });
    }
    if let Some(p) = supplied.filter(|p| !p.is_finite()) {
        return Err(GoalError::InvalidProgress { value: p });
    }

    let previous = goal.progress.percentage;
    let pct = match goal.goal_type {
        GoalType::Target => percentage(value, goal.target.value),
        GoalType::Habit | GoalType::Milestone => supplied.map_or(previous, clamp_percentage),
    };

    let mut next = goal.clone();
    next.progress.current = value;
    next.progress.percentage = pct;
    next.progress.last_updated = ctx.now;

    let milestone = ctx.milestones.records(value, note.is_some()).then(|| Milestone {
        value,
        percentage: pct,
        note: note.map(str::to_owned),
        achieved_at: ctx.now,
    });
    if let Some(m) = &milestone {
        next.progress.milestones.push(m.clone());
    }

    let completes = pct >= 100;
    if completes {
        next.status = GoalStatus::Completed;
        next.completed_at = Some(ctx.now);
    }

    let mut events = vec![DomainEvent::new(
        names::GOAL_PROGRESS_UPDATED,
        goal.user_id.clone(),
        json!({
            "goalId": goal.id,
            "status": next.status,
            "current": value,
            "percentage": pct,
            "previousPercentage": previous,
            "target": next.target,
            "milestone": milestone,
            "lastUpdated": ctx.now,
        }),
        ctx.now,
    )];
    if completes {
        events.push(DomainEvent::new(
            names::GOAL_COMPLETED,
            goal.user_id.clone(),
            completed_payload(&next),
            ctx.now,
        ));
    }

    Ok(Transition { goal: next, events })
}

fn close(
    goal: &Goal,
    status: GoalStatus,
    event_type: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Transition {
    let mut next = goal.clone();
    next.status = status;
    next.paused_reason = None;
    next.closed_reason = reason.map(str::to_owned);
    let payload = json!({
        "goalId": goal.id,
        "reason": reason,
        "percentage": goal.progress.percentage,
    });
    single(next, event_type, payload, now)
}

fn completed_payload(goal: &Goal) -> Value {
    json!({
        "goalId": goal.id,
        "title": goal.title,
        "completedAt": goal.completed_at,
        "note": goal.completion_note,
        "percentage": goal.progress.percentage,
    })
}

fn single(goal: Goal, event_type: &str, payload: Value, now: DateTime<Utc>) -> Transition {
    let event = DomainEvent::new(event_type, goal.user_id.clone(), payload, now);
    Transition {
        goal,
        events: vec![event],
    }
}

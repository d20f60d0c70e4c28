//! Percentage computation and milestone policy.

use pulse_settings::{GoalSettings, MilestoneRule};

/// Completion percentage of `value` against `target`, rounded and clamped to
/// `0..=100`.
///
/// A non-positive or non-finite target yields 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn percentage(value: f64, target: f64) -> u8 {
    if !value.is_finite() || !target.is_finite() || target <= 0.0 {
        return 0;
    }
    clamp_percentage(value / target * 100.0)
}

/// Round and clamp a caller-supplied percentage.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn clamp_percentage(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// Decides when a progress update records a milestone without a note.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MilestonePolicy {
    /// Record when the value is an exact positive multiple of the step.
    EveryMultipleOf(f64),
    /// Record only updates that carry a note.
    NotesOnly,
}

impl Default for MilestonePolicy {
    fn default() -> Self {
        Self::EveryMultipleOf(10.0)
    }
}

impl MilestonePolicy {
    /// Whether an update to `value` (with or without a note) is a milestone.
    pub fn records(&self, value: f64, has_note: bool) -> bool {
        if has_note {
            return true;
        }
        match *self {
            Self::EveryMultipleOf(step) => {
                step > 0.0 && value > 0.0 && (value % step).abs() < f64::EPSILON
            }
            Self::NotesOnly => false,
        }
    }
}

impl From<&GoalSettings> for MilestonePolicy {
    fn from(settings: &GoalSettings) -> Self {
        match settings.milestone_rule {
            MilestoneRule::Multiple => Self::EveryMultipleOf(settings.milestone_step),
            MilestoneRule::NotesOnly => Self::NotesOnly,
        }
    }
}

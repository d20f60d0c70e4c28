//! # pulse-goals
//!
//! Goal lifecycle for the sync server.
//!
//! - [`apply_goal_event`]: pure transition function, `(goal, event) ->
//!   (goal', events)`
//! - [`percentage`] and [`MilestonePolicy`]: progress arithmetic
//! - [`GoalStore`]: persistence seam with optimistic versioning
//! - [`GoalService`]: load, transition, save, then emit through an
//!   [`EventSink`](pulse_core::EventSink)

#![deny(unsafe_code)]

pub mod errors;
pub mod machine;
pub mod progress;
pub mod service;
pub mod store;
pub mod types;

pub use errors::{GoalError, InvalidTransition, StoreError};
pub use machine::{GoalEvent, Transition, TransitionContext, apply_goal_event};
pub use progress::{MilestonePolicy, clamp_percentage, percentage};
pub use service::GoalService;
pub use store::{GoalStore, InMemoryGoalStore};
pub use types::{Goal, GoalProgress, GoalStatus, GoalTarget, GoalType, Milestone, Timeframe};

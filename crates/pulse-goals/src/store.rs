//! Goal persistence seam.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use pulse_core::GoalId;

use crate::errors::StoreError;
use crate::types::Goal;

/// Loads and saves goals with optimistic versioning.
///
/// `save` must reject a goal whose `version` differs from the stored one with
/// [`StoreError::Conflict`], and return the stored copy with the bumped
/// version on success.
#[async_trait]
pub trait GoalStore: Send + Sync {
    /// Fetch the current goal.
    async fn load(&self, id: &GoalId) -> Result<Goal, StoreError>;

    /// Persist `goal`, which was derived from the copy at `goal.version`.
    async fn save(&self, goal: &Goal) -> Result<Goal, StoreError>;
}

/// Process-local store for the daemon and tests.
#[derive(Debug, Default)]
pub struct InMemoryGoalStore {
    goals: RwLock<HashMap<GoalId, Goal>>,
}

impl InMemoryGoalStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a goal as-is, returning the previous copy.
    pub fn insert(&self, goal: Goal) -> Option<Goal> {
        self.goals.write().insert(goal.id.clone(), goal)
    }

    /// Stored copy, if any.
    pub fn get(&self, id: &GoalId) -> Option<Goal> {
        self.goals.read().get(id).cloned()
    }

    /// Number of stored goals.
    pub fn len(&self) -> usize {
        self.goals.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.goals.read().is_empty()
    }
}

#[async_trait]
impl GoalStore for InMemoryGoalStore {
    async fn load(&self, id: &GoalId) -> Result<Goal, StoreError> {
        self.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(&self, goal: &Goal) -> Result<Goal, StoreError> {
        let mut goals = self.goals.write();
        let stored = goals
            .get_mut(&goal.id)
            .ok_or_else(|| StoreError::NotFound(goal.id.clone()))?;
        if stored.version != goal.version {
            return Err(StoreError::Conflict {
                goal_id: goal.id.clone(),
                expected: goal.version,
                found: stored.version,
            });
        }
        let mut saved = goal.clone();
        saved.version += 1;
        stored.clone_from(&saved);
        Ok(saved)
    }
}

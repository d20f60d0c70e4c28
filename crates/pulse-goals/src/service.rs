//! Persisted goal transitions: load, transition, save, emit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pulse_core::{Clock, ConnectionId, EventSink, GoalId, UserId};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::errors::{GoalError, StoreError};
use crate::machine::{GoalEvent, Transition, TransitionContext, apply_goal_event};
use crate::progress::MilestonePolicy;
use crate::store::GoalStore;
use crate::types::Goal;

/// How many times a transition is recomputed after losing a version race.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Metric: accepted goal transitions, labelled by event.
pub const GOAL_TRANSITIONS_TOTAL: &str = "goal_transitions_total";
/// Metric: rejected goal events, labelled by error code.
pub const GOAL_REJECTIONS_TOTAL: &str = "goal_rejections_total";

/// One async gate per goal with a transition in flight.
#[derive(Default)]
struct GoalGates {
    gates: Mutex<HashMap<GoalId, Arc<AsyncMutex<()>>>>,
}

impl GoalGates {
    /// Wait for exclusive use of `id`. Held from load through emit.
    async fn enter(&self, id: &GoalId) -> GateGuard<'_> {
        let gate = self.gates.lock().entry(id.clone()).or_default().clone();
        let mut guard = GateGuard {
            gates: self,
            id: id.clone(),
            gate: Some(gate.clone()),
            held: None,
        };
        guard.held = Some(gate.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn open(&self) -> usize {
        self.gates.lock().len()
    }
}

struct GateGuard<'a> {
    gates: &'a GoalGates,
    id: GoalId,
    gate: Option<Arc<AsyncMutex<()>>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut gates = self.gates.gates.lock();
        drop(self.gate.take());
        // only the map still refers to it: nobody is queued
        if gates.get(&self.id).is_some_and(|g| Arc::strong_count(g) == 1) {
            let _ = gates.remove(&self.id);
        }
    }
}

/// Applies goal events against a store and publishes the result.
///
/// Events are emitted only after the save succeeds, so a rejected or
/// conflicting transition never reaches any device. Transitions of one goal
/// run one at a time from load through emit, so devices receive them in
/// version order even when the store acknowledges saves out of order.
pub struct GoalService {
    store: Arc<dyn GoalStore>,
    sink: Arc<dyn EventSink>,
    policy: MilestonePolicy,
    clock: Arc<dyn Clock>,
    gates: GoalGates,
}

impl GoalService {
    /// Create a service.
    pub fn new(
        store: Arc<dyn GoalStore>,
        sink: Arc<dyn EventSink>,
        policy: MilestonePolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sink,
            policy,
            clock,
            gates: GoalGates::default(),
        }
    }

    /// Apply `event` to `user_id`'s goal `goal_id`.
    ///
    /// `origin` is the connection the request arrived on, if any. Goals owned
    /// by another user are reported as not found.
    #[instrument(skip_all, fields(user_id = %user_id, goal_id = %goal_id, event = event.name()))]
    pub async fn apply(
        &self,
        user_id: &UserId,
        goal_id: &GoalId,
        event: GoalEvent,
        origin: Option<&ConnectionId>,
    ) -> Result<Goal, GoalError> {
        let _gate = self.gates.enter(goal_id).await;
        let result = self.apply_inner(user_id, goal_id, &event, origin).await;
        if let Err(e) = &result {
            metrics::counter!(GOAL_REJECTIONS_TOTAL, "code" => e.code()).increment(1);
        }
        result
    }

    async fn apply_inner(
        &self,
        user_id: &UserId,
        goal_id: &GoalId,
        event: &GoalEvent,
        origin: Option<&ConnectionId>,
    ) -> Result<Goal, GoalError> {
        let mut attempt = 0;
        loop {
            let current = self.store.load(goal_id).await?;
            if current.user_id != *user_id {
                return Err(GoalError::NotFound(goal_id.clone()));
            }

            let ctx = TransitionContext {
                now: self.clock.now(),
                milestones: &self.policy,
            };
            let Transition { goal, events } = apply_goal_event(&current, event, &ctx)?;

            match self.store.save(&goal).await {
                Ok(saved) => {
                    let events = events.into_iter().map(|e| e.with_origin(origin)).collect();
                    let delivered = self.sink.emit(events).await;
                    metrics::counter!(GOAL_TRANSITIONS_TOTAL, "event" => event.name())
                        .increment(1);
                    info!(
                        from = %current.status,
                        to = %saved.status,
                        percentage = saved.progress.percentage,
                        delivered,
                        "goal transition applied"
                    );
                    return Ok(saved);
                }
                Err(StoreError::Conflict { found, .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(attempt, found, "goal changed underneath, retrying");
                }
                Err(e) => {
                    warn!(error = %e, "goal save failed");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGoalStore;
    use crate::types::{GoalStatus, GoalTarget, GoalType, Timeframe};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use pulse_core::events::names;
    use pulse_core::{DomainEvent, ManualClock};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        emitted: Mutex<Vec<DomainEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, events: Vec<DomainEvent>) -> usize {
            let n = events.len();
            self.emitted.lock().extend(events);
            n
        }
    }

    /// Fails the first `conflicts` saves with a version conflict.
    struct FlakyStore {
        inner: InMemoryGoalStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl GoalStore for FlakyStore {
        async fn load(&self, id: &GoalId) -> Result<Goal, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, goal: &Goal) -> Result<Goal, StoreError> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Conflict {
                    goal_id: goal.id.clone(),
                    expected: goal.version,
                    found: goal.version + 1,
                });
            }
            self.inner.save(goal).await
        }
    }

    /// Acknowledges its first save late, after signalling `first_saved`.
    struct SlowAckStore {
        inner: InMemoryGoalStore,
        pending: AtomicBool,
        first_saved: Notify,
    }

    impl SlowAckStore {
        fn new(inner: InMemoryGoalStore) -> Self {
            Self {
                inner,
                pending: AtomicBool::new(true),
                first_saved: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl GoalStore for SlowAckStore {
        async fn load(&self, id: &GoalId) -> Result<Goal, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, goal: &Goal) -> Result<Goal, StoreError> {
            let saved = self.inner.save(goal).await?;
            if self.pending.swap(false, Ordering::SeqCst) {
                self.first_saved.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(saved)
        }
    }

    fn goal(owner: &str, target: f64) -> Goal {
        let t = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        Goal::new(
            owner.into(),
            "Steps",
            GoalType::Target,
            GoalTarget {
                value: target,
                unit: "km".into(),
            },
            Timeframe { start: t, end: None },
            t,
        )
    }

    fn service(store: Arc<dyn GoalStore>, sink: Arc<RecordingSink>) -> GoalService {
        GoalService::new(
            store,
            sink,
            MilestonePolicy::default(),
            Arc::new(ManualClock::default()),
        )
    }

    fn progress(value: f64) -> GoalEvent {
        GoalEvent::UpdateProgress {
            value,
            percentage: None,
            note: None,
        }
    }

    #[tokio::test]
    async fn completes_and_emits_in_order() {
        let store = Arc::new(InMemoryGoalStore::new());
        let sink = Arc::new(RecordingSink::default());
        let g = goal("u1", 65.0);
        let _ = store.insert(g.clone());

        let origin = ConnectionId::from("conn_a");
        let saved = service(store.clone(), sink.clone())
            .apply(&"u1".into(), &g.id, progress(65.0), Some(&origin))
            .await
            .unwrap();

        assert_eq!(saved.status, GoalStatus::Completed);
        assert_eq!(saved.version, 1);
        let emitted = sink.emitted.lock();
        let types: Vec<_> = emitted.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec![names::GOAL_PROGRESS_UPDATED, names::GOAL_COMPLETED]);
        assert!(emitted.iter().all(|e| e.exclude_connection_id.is_none()));
    }

    #[tokio::test]
    async fn other_users_goal_is_not_found() {
        let store = Arc::new(InMemoryGoalStore::new());
        let sink = Arc::new(RecordingSink::default());
        let g = goal("u1", 10.0);
        let _ = store.insert(g.clone());

        let result = service(store.clone(), sink.clone())
            .apply(&"intruder".into(), &g.id, progress(5.0), None)
            .await;
        assert_matches!(result, Err(GoalError::NotFound(_)));
        assert!(sink.emitted.lock().is_empty());
        assert_eq!(store.get(&g.id).unwrap().version, 0);
    }

    #[tokio::test]
    async fn invalid_transition_saves_and_emits_nothing() {
        let store = Arc::new(InMemoryGoalStore::new());
        let sink = Arc::new(RecordingSink::default());
        let g = goal("u1", 10.0);
        let _ = store.insert(g.clone());
        let svc = service(store.clone(), sink.clone());

        let _ = svc
            .apply(&"u1".into(), &g.id, GoalEvent::Complete { note: None }, None)
            .await
            .unwrap();
        sink.emitted.lock().clear();

        let result = svc
            .apply(&"u1".into(), &g.id, GoalEvent::Complete { note: None }, None)
            .await;
        assert_matches!(result, Err(GoalError::InvalidTransition(_)));
        assert!(sink.emitted.lock().is_empty());
        assert_eq!(store.get(&g.id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn retries_after_conflict() {
        let inner = InMemoryGoalStore::new();
        let g = goal("u1", 10.0);
        let _ = inner.insert(g.clone());
        let store = Arc::new(FlakyStore {
            inner,
            conflicts: AtomicU32::new(2),
        });
        let sink = Arc::new(RecordingSink::default());

        let saved = service(store, sink.clone())
            .apply(&"u1".into(), &g.id, progress(5.0), None)
            .await
            .unwrap();
        assert_eq!(saved.progress.percentage, 50);
        assert_eq!(sink.emitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_repeated_conflicts() {
        let inner = InMemoryGoalStore::new();
        let g = goal("u1", 10.0);
        let _ = inner.insert(g.clone());
        let store = Arc::new(FlakyStore {
            inner,
            conflicts: AtomicU32::new(MAX_CONFLICT_RETRIES + 1),
        });
        let sink = Arc::new(RecordingSink::default());

        let result = service(store, sink.clone())
            .apply(&"u1".into(), &g.id, progress(5.0), None)
            .await;
        assert_matches!(result, Err(GoalError::Conflict(_)));
        assert!(sink.emitted.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_updates_emit_in_version_order() {
        let inner = InMemoryGoalStore::new();
        let g = goal("u1", 100.0);
        let _ = inner.insert(g.clone());
        let store = Arc::new(SlowAckStore::new(inner));
        let sink = Arc::new(RecordingSink::default());
        let svc = Arc::new(service(store.clone(), sink.clone()));

        let first = tokio::spawn({
            let svc = svc.clone();
            let id = g.id.clone();
            async move { svc.apply(&"u1".into(), &id, progress(30.0), None).await }
        });
        store.first_saved.notified().await;
        let second = svc
            .apply(&"u1".into(), &g.id, progress(100.0), None)
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.status, GoalStatus::Completed);
        let seen: Vec<_> = sink
            .emitted
            .lock()
            .iter()
            .map(|e| (e.event_type.clone(), e.payload["percentage"].as_u64()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (names::GOAL_PROGRESS_UPDATED.to_owned(), Some(30)),
                (names::GOAL_PROGRESS_UPDATED.to_owned(), Some(100)),
                (names::GOAL_COMPLETED.to_owned(), Some(100)),
            ]
        );
        assert_eq!(svc.gates.open(), 0);
    }

    #[tokio::test]
    async fn gate_is_released_after_rejection() {
        let store = Arc::new(InMemoryGoalStore::new());
        let sink = Arc::new(RecordingSink::default());
        let g = goal("u1", 10.0);
        let _ = store.insert(g.clone());
        let svc = service(store.clone(), sink.clone());

        let result = svc
            .apply(&"intruder".into(), &g.id, progress(5.0), None)
            .await;
        assert_matches!(result, Err(GoalError::NotFound(_)));
        assert_eq!(svc.gates.open(), 0);

        let saved = svc
            .apply(&"u1".into(), &g.id, progress(5.0), None)
            .await
            .unwrap();
        assert_eq!(saved.version, 1);
    }
}

//! Live connections grouped by user.
//!
//! Two indices are kept: user channels (the members a publish fans out to)
//! and a flat connection index (lookup by id, reaper snapshots). Locks are
//! always taken in the order channel shard, member map, index shard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::gauge;
use parking_lot::RwLock;
use pulse_core::{Clock, ConnectionId, UserId};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::connection::{ConnectionHandle, DeviceConnection};
use crate::metrics::SYNC_CONNECTIONS_ACTIVE;

/// Registry invariants broken. Never expected in a correct build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The two indices disagree about a connection.
    #[error("registry inconsistent for {connection_id} (user {user_id}): {detail}")]
    ConsistencyViolation {
        /// User channel being checked.
        user_id: UserId,
        /// Offending connection.
        connection_id: ConnectionId,
        /// What disagreed.
        detail: &'static str,
    },
}

/// One user's live connections plus the lock that serializes publishes.
#[derive(Default)]
pub(crate) struct UserChannel {
    members: RwLock<HashMap<ConnectionId, Arc<DeviceConnection>>>,
    delivery: Mutex<()>,
}

impl UserChannel {
    /// Hold this to deliver to the channel; publishes to one user never
    /// interleave.
    pub(crate) async fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().await
    }

    /// Open members except `exclude`, oldest first.
    pub(crate) fn recipients(&self, exclude: Option<&ConnectionId>) -> Vec<Arc<DeviceConnection>> {
        let mut out: Vec<_> = self
            .members
            .read()
            .values()
            .filter(|c| c.is_open() && Some(c.id()) != exclude)
            .cloned()
            .collect();
        sort_by_establishment(&mut out);
        out
    }

    /// Open member with this id.
    pub(crate) fn member(&self, id: &ConnectionId) -> Option<Arc<DeviceConnection>> {
        self.members
            .read()
            .get(id)
            .filter(|c| c.is_open())
            .cloned()
    }
}

fn sort_by_establishment(conns: &mut [Arc<DeviceConnection>]) {
    conns.sort_by(|a, b| {
        a.established_at()
            .cmp(&b.established_at())
            .then_with(|| a.id().cmp(b.id()))
    });
}

/// Tracks every live connection, grouped by user.
pub struct ConnectionRegistry {
    channels: DashMap<UserId, Arc<UserChannel>>,
    index: DashMap<ConnectionId, Arc<DeviceConnection>>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    /// Empty registry reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            channels: DashMap::new(),
            index: DashMap::new(),
            clock,
        }
    }

    /// Add a connection to `user_id`'s channel.
    ///
    /// Both indices are written while the channel's shard is held, so a
    /// concurrent publish sees the connection fully or not at all.
    pub fn register(&self, user_id: &UserId, handle: ConnectionHandle) -> ConnectionId {
        let id = ConnectionId::generate();
        let conn = Arc::new(DeviceConnection::new(
            id.clone(),
            user_id.clone(),
            handle,
            self.clock.now(),
        ));

        let channel = self.channels.entry(user_id.clone()).or_default();
        let _ = channel.members.write().insert(id.clone(), conn.clone());
        let _ = self.index.insert(id.clone(), conn);
        drop(channel);
        self.record_active();

        debug!(user_id = %user_id, connection_id = %id, "connection registered");
        id
    }

    /// Record inbound activity. Returns whether the connection is live.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        let now = self.clock.now();
        self.index.get(id).is_some_and(|c| c.touch(now))
    }

    /// Remove a connection, close it and return it. No-op when absent.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<DeviceConnection>> {
        let user_id = self.index.get(id).map(|c| c.user_id().clone())?;

        let removed = self
            .channels
            .get(&user_id)
            .and_then(|channel| channel.members.write().remove(id));
        let _ = self.index.remove(id);
        let _ = self
            .channels
            .remove_if(&user_id, |_, channel| channel.members.read().is_empty());

        let conn = removed?;
        conn.close();
        self.record_active();
        debug!(user_id = %user_id, connection_id = %id, "connection unregistered");
        Some(conn)
    }

    /// Unregister `id` only if it has been idle longer than `threshold` at
    /// `now`. Staleness is re-checked on the connection itself, so a touch
    /// racing with the reaper is never lost.
    pub fn remove_if_idle(
        &self,
        id: &ConnectionId,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Option<Arc<DeviceConnection>> {
        let conn = self.get(id)?;
        if !conn.close_if_idle(threshold, now) {
            return None;
        }
        self.unregister(id)
    }

    /// Live connections of `user_id`, oldest first. A copy: safe to iterate
    /// while the registry changes.
    pub fn connections_for(&self, user_id: &UserId) -> Vec<Arc<DeviceConnection>> {
        self.channel(user_id)
            .map(|channel| channel.recipients(None))
            .unwrap_or_default()
    }

    /// Every live connection across all users.
    pub fn snapshot(&self) -> Vec<Arc<DeviceConnection>> {
        let mut out: Vec<_> = self
            .index
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|c| c.is_open())
            .collect();
        sort_by_establishment(&mut out);
        out
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<DeviceConnection>> {
        self.index
            .get(id)
            .map(|c| c.value().clone())
            .filter(|c| c.is_open())
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.index.len()
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.channels.len()
    }

    /// Current time on the registry's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        gauge!(SYNC_CONNECTIONS_ACTIVE).set(self.index.len() as f64);
    }

    pub(crate) fn channel(&self, user_id: &UserId) -> Option<Arc<UserChannel>> {
        self.channels.get(user_id).map(|c| c.value().clone())
    }

    /// Check that every channel member is indexed under the same connection
    /// and the same user.
    pub fn verify_consistency(&self) -> Result<(), RegistryError> {
        for entry in self.channels.iter() {
            let user_id = entry.key();
            for (id, conn) in entry.value().members.read().iter() {
                let violation = |detail| RegistryError::ConsistencyViolation {
                    user_id: user_id.clone(),
                    connection_id: id.clone(),
                    detail,
                };
                if conn.user_id() != user_id {
                    return Err(violation("member filed under the wrong user"));
                }
                match self.index.get(id) {
                    None => return Err(violation("member missing from connection index")),
                    Some(indexed) if !Arc::ptr_eq(indexed.value(), conn) => {
                        return Err(violation("index points at a different connection"));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

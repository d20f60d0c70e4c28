//! Per-user event fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use pulse_core::{Clock, ConnectionId, DomainEvent, EventSink, UserId};
use serde_json::Value;
use tracing::{debug, warn};

use super::connection::{DeliveryFailure, DeviceConnection};
use super::registry::{ConnectionRegistry, UserChannel};
use crate::metrics::{
    SYNC_DELIVERY_FAILURES_TOTAL, SYNC_DISCONNECTIONS_TOTAL, SYNC_EVENTS_PUBLISHED_TOTAL,
};

/// `reason` on notices and metrics for connections dropped by the bus.
pub const DROPPED_REASON: &str = "delivery-failure";

/// Publishes events to every live connection of a user.
///
/// Each event is serialized once and written to all recipients
/// concurrently. A recipient that is closed or stays full past the send
/// timeout is unregistered and its transport closed; the others still get
/// the frame, followed by a `device:disconnected` for the dropped one.
pub struct FanoutBus {
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
}

impl FanoutBus {
    /// Create a bus over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, clock: Arc<dyn Clock>, send_timeout: Duration) -> Self {
        Self {
            registry,
            clock,
            send_timeout,
        }
    }

    /// The registry this bus delivers through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver `{type, payload, timestamp}` to every live connection of
    /// `user_id` except `exclude`. Returns the number of connections reached.
    pub async fn publish(
        &self,
        user_id: &UserId,
        event_type: &str,
        payload: Value,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let mut event = DomainEvent::new(event_type, user_id.clone(), payload, self.clock.now());
        event.exclude_connection_id = exclude.cloned();
        self.publish_batch(user_id, vec![event]).await
    }

    /// Publish an event caused by `origin`. Whether `origin` receives it too
    /// is decided by [`delivery_scope`](pulse_core::delivery_scope).
    pub async fn publish_from(
        &self,
        origin: &DeviceConnection,
        event_type: &str,
        payload: Value,
    ) -> usize {
        let user_id = origin.user_id();
        let event = DomainEvent::new(event_type, user_id.clone(), payload, self.clock.now())
            .with_origin(Some(origin.id()));
        self.publish_batch(user_id, vec![event]).await
    }

    /// Deliver `events` in order under one hold of the user's delivery lock.
    ///
    /// Every event must be addressed to `user_id`; others are skipped.
    /// Connections dropped on the way are announced to their siblings once
    /// the lock is released.
    pub async fn publish_batch(&self, user_id: &UserId, events: Vec<DomainEvent>) -> usize {
        let (delivered, dropped) = self.deliver_batch(user_id, &events).await;
        self.announce_dropped(user_id, dropped).await;
        delivered
    }

    /// Deliver one event to a single member of `user_id`'s channel.
    ///
    /// Returns `false` when the connection is not a live member or the
    /// delivery failed.
    pub async fn send_to(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
        event_type: &str,
        payload: Value,
    ) -> bool {
        let event = DomainEvent::new(event_type, user_id.clone(), payload, self.clock.now());
        let (sent, dropped) = self.deliver_to(user_id, connection_id, &event).await;
        self.announce_dropped(user_id, dropped.into_iter().collect()).await;
        sent
    }

    async fn deliver_batch(
        &self,
        user_id: &UserId,
        events: &[DomainEvent],
    ) -> (usize, Vec<Arc<DeviceConnection>>) {
        let Some(channel) = self.registry.channel(user_id) else {
            debug!(user_id = %user_id, events = events.len(), "no live connections, nothing to publish");
            return (0, Vec::new());
        };
        let _order = channel.lock_delivery().await;

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for event in events {
            if event.user_id != *user_id {
                warn!(
                    user_id = %user_id,
                    event_user = %event.user_id,
                    event_type = %event.event_type,
                    "event addressed to another user skipped"
                );
                continue;
            }
            delivered += self.deliver_event(&channel, event, &mut dropped).await;
        }
        (delivered, dropped)
    }

    async fn deliver_to(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
        event: &DomainEvent,
    ) -> (bool, Option<Arc<DeviceConnection>>) {
        let Some(channel) = self.registry.channel(user_id) else {
            return (false, None);
        };
        let _order = channel.lock_delivery().await;
        let Some(conn) = channel.member(connection_id) else {
            return (false, None);
        };
        let Some(frame) = encode(event) else {
            return (false, None);
        };
        match conn.deliver(frame, self.send_timeout).await {
            Ok(()) => {
                counter!(SYNC_EVENTS_PUBLISHED_TOTAL, "type" => event.event_type.clone()).increment(1);
                (true, None)
            }
            Err(failure) => {
                let dropped = self.drop_connection(&conn, &event.event_type, failure);
                (false, dropped.then_some(conn))
            }
        }
    }

    async fn deliver_event(
        &self,
        channel: &UserChannel,
        event: &DomainEvent,
        dropped: &mut Vec<Arc<DeviceConnection>>,
    ) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let recipients = channel.recipients(event.exclude_connection_id.as_ref());
        let results = join_all(
            recipients
                .iter()
                .map(|conn| conn.deliver(frame.clone(), self.send_timeout)),
        )
        .await;

        let mut delivered = 0;
        for (conn, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    if self.drop_connection(conn, &event.event_type, failure) {
                        dropped.push(conn.clone());
                    }
                }
            }
        }

        counter!(SYNC_EVENTS_PUBLISHED_TOTAL, "type" => event.event_type.clone()).increment(1);
        debug!(
            user_id = %event.user_id,
            event_type = %event.event_type,
            recipients = recipients.len(),
            delivered,
            "event published"
        );
        delivered
    }

    /// Publish `device:disconnected` for each dropped connection. A notice
    /// that drops another connection is followed by that one's notice.
    async fn announce_dropped(&self, user_id: &UserId, mut dropped: Vec<Arc<DeviceConnection>>) {
        while !dropped.is_empty() {
            let now = self.clock.now();
            let notices: Vec<_> = dropped
                .iter()
                .map(|conn| conn.disconnected_event(DROPPED_REASON, now))
                .collect();
            dropped = self.deliver_batch(user_id, &notices).await.1;
        }
    }

    /// Unregister and close `conn`. Returns `true` if this call removed it.
    fn drop_connection(&self, conn: &DeviceConnection, event_type: &str, failure: DeliveryFailure) -> bool {
        warn!(
            user_id = %conn.user_id(),
            connection_id = %conn.id(),
            event_type,
            error = %failure,
            "delivery failed, dropping connection"
        );
        let reason = match failure {
            DeliveryFailure::Closed => "closed",
            DeliveryFailure::Timeout(_) => "timeout",
        };
        counter!(SYNC_DELIVERY_FAILURES_TOTAL, "reason" => reason).increment(1);
        if self.registry.unregister(conn.id()).is_some() {
            counter!(SYNC_DISCONNECTIONS_TOTAL, "reason" => DROPPED_REASON).increment(1);
            true
        } else {
            conn.close();
            false
        }
    }
}

fn encode(event: &DomainEvent) -> Option<Arc<String>> {
    match serde_json::to_string(&event.envelope()) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(event_type = %event.event_type, error = %e, "failed to serialize event");
            None
        }
    }
}

#[async_trait]
impl EventSink for FanoutBus {
    async fn emit(&self, events: Vec<DomainEvent>) -> usize {
        let Some(user_id) = events.first().map(|e| e.user_id.clone()) else {
            return 0;
        };
        self.publish_batch(&user_id, events).await
    }
}

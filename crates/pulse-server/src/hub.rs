//! Transport-independent entry points: admit, dispatch, publish, disconnect.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use pulse_auth::{AuthFailure, AuthHandshake, Principal};
use pulse_core::events::names;
use pulse_core::{Clock, ConnectionId, UserId};
use pulse_goals::{GoalService, GoalStore, MilestonePolicy};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::metrics::{
    SYNC_CONNECTIONS_TOTAL, SYNC_DISCONNECTIONS_TOTAL, SYNC_HANDSHAKE_REJECTIONS_TOTAL,
    SYNC_INBOUND_ERRORS_TOTAL,
};
use crate::sync::{
    ConnectionHandle, ConnectionRegistry, DeviceConnection, DispatchError, Dispatched, Dispatcher,
    FanoutBus, IdleReaper, InboundEvent, InboundFrame,
};

/// Owns the registry, the bus and the goal service for one server.
pub struct SyncHub {
    handshake: AuthHandshake,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<FanoutBus>,
    goals: Arc<GoalService>,
    dispatcher: Dispatcher,
}

impl SyncHub {
    /// Wire up a hub. Goal transitions are published through the hub's own
    /// bus.
    pub fn new(
        handshake: AuthHandshake,
        goal_store: Arc<dyn GoalStore>,
        policy: MilestonePolicy,
        clock: Arc<dyn Clock>,
        send_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(clock.clone()));
        let bus = Arc::new(FanoutBus::new(registry.clone(), clock.clone(), send_timeout));
        let goals = Arc::new(GoalService::new(goal_store, bus.clone(), policy, clock));
        let dispatcher = Dispatcher::new(bus.clone(), goals.clone());
        Self {
            handshake,
            registry,
            bus,
            goals,
            dispatcher,
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Fan-out bus.
    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    /// Persisted goal transitions, published through this hub.
    pub fn goals(&self) -> &Arc<GoalService> {
        &self.goals
    }

    /// An idle reaper over this hub's registry.
    pub fn reaper(&self, threshold: Duration, interval: Duration) -> IdleReaper {
        IdleReaper::new(self.registry.clone(), self.bus.clone(), threshold, interval)
    }

    /// Run the handshake without admitting anything.
    pub async fn authenticate(&self, raw_credential: Option<&str>) -> Result<Principal, AuthFailure> {
        let result = self.handshake.accept(raw_credential).await;
        if let Err(e) = &result {
            counter!(SYNC_HANDSHAKE_REJECTIONS_TOTAL, "reason" => e.reason()).increment(1);
            info!(reason = e.reason(), "connection refused");
        }
        result
    }

    /// Register an authenticated device, greet it with
    /// `connection:established` and tell its siblings `device:connected`.
    pub async fn admit(&self, principal: &Principal, handle: ConnectionHandle) -> ConnectionId {
        let user_id = &principal.user_id;
        let id = self.registry.register(user_id, handle);
        counter!(SYNC_CONNECTIONS_TOTAL).increment(1);

        let Some(conn) = self.registry.get(&id) else {
            return id;
        };
        let devices: Vec<_> = self
            .registry
            .connections_for(user_id)
            .iter()
            .map(|c| c.info())
            .collect();
        info!(
            user_id = %user_id,
            connection_id = %id,
            device = conn.device(),
            devices = devices.len(),
            "device connected"
        );

        let _ = self
            .bus
            .send_to(
                user_id,
                &id,
                names::CONNECTION_ESTABLISHED,
                json!({
                    "connectionId": id,
                    "userId": user_id,
                    "device": conn.device(),
                    "establishedAt": conn.established_at(),
                    "devices": devices,
                }),
            )
            .await;
        let _ = self
            .bus
            .publish_from(
                &conn,
                names::DEVICE_CONNECTED,
                json!({
                    "connectionId": id,
                    "device": conn.device(),
                    "establishedAt": conn.established_at(),
                }),
            )
            .await;
        id
    }

    /// Handshake then admit.
    pub async fn connect(
        &self,
        raw_credential: Option<&str>,
        handle: ConnectionHandle,
    ) -> Result<ConnectionId, AuthFailure> {
        let principal = self.authenticate(raw_credential).await?;
        Ok(self.admit(&principal, handle).await)
    }

    /// Handle a raw text frame from `id`.
    ///
    /// Failures other than an unknown connection are also reported to the
    /// sender as an `error` frame.
    pub async fn on_frame(&self, id: &ConnectionId, text: &str) -> Result<Dispatched, DispatchError> {
        let conn = self.live(id)?;
        match InboundFrame::parse(text) {
            Ok(frame) => self.process(&conn, &frame.event_type, frame.payload).await,
            Err(e) => {
                self.reject(&conn, None, &e).await;
                Err(e)
            }
        }
    }

    /// Handle an already-decoded event from `id`.
    pub async fn on_message(
        &self,
        id: &ConnectionId,
        event_type: &str,
        payload: Value,
    ) -> Result<Dispatched, DispatchError> {
        let conn = self.live(id)?;
        self.process(&conn, event_type, payload).await
    }

    /// Publish to `user_id`'s devices. See [`FanoutBus::publish`].
    pub async fn publish(
        &self,
        user_id: &UserId,
        event_type: &str,
        payload: Value,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        self.bus.publish(user_id, event_type, payload, exclude).await
    }

    /// Unregister `id` and tell its siblings. Returns `false` if it was
    /// already gone, e.g. reaped or dropped by the bus.
    pub async fn disconnect(&self, id: &ConnectionId, reason: &'static str) -> bool {
        let Some(conn) = self.registry.unregister(id) else {
            return false;
        };
        counter!(SYNC_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
        info!(user_id = %conn.user_id(), connection_id = %id, reason, "device disconnected");
        let notice = conn.disconnected_event(reason, self.registry.now());
        let _ = self.bus.publish_batch(conn.user_id(), vec![notice]).await;
        true
    }

    fn live(&self, id: &ConnectionId) -> Result<Arc<DeviceConnection>, DispatchError> {
        self.registry
            .get(id)
            .filter(|_| self.registry.touch(id))
            .ok_or_else(|| DispatchError::UnknownConnection(id.clone()))
    }

    async fn process(
        &self,
        conn: &DeviceConnection,
        event_type: &str,
        payload: Value,
    ) -> Result<Dispatched, DispatchError> {
        let result = match InboundEvent::parse(event_type, payload) {
            Ok(event) => self.dispatcher.dispatch(conn, event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.reject(conn, Some(event_type), e).await;
        }
        result
    }

    async fn reject(&self, conn: &DeviceConnection, event_type: Option<&str>, error: &DispatchError) {
        counter!(SYNC_INBOUND_ERRORS_TOTAL, "code" => error.code()).increment(1);
        match error {
            DispatchError::Goal(_) => {
                debug!(connection_id = %conn.id(), code = error.code(), error = %error, "goal event rejected");
            }
            _ => {
                warn!(connection_id = %conn.id(), code = error.code(), error = %error, "inbound frame rejected");
            }
        }
        let _ = self
            .bus
            .send_to(
                conn.user_id(),
                conn.id(),
                names::ERROR,
                json!({
                    "code": error.code(),
                    "message": error.to_string(),
                    "event": event_type,
                }),
            )
            .await;
    }
}

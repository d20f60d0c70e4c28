//! Domain events and the wire names they travel under.
//!
//! A [`DomainEvent`] is addressed to one user's channel. Whether the
//! connection that caused it also receives it is fixed per event type by
//! [`delivery_scope`], never decided ad hoc at the call site.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, UserId};

/// Outbound event names.
pub mod names {
    /// Sent to a device right after it is admitted.
    pub const CONNECTION_ESTABLISHED: &str = "connection:established";
    /// Another device of the same user connected.
    pub const DEVICE_CONNECTED: &str = "device:connected";
    /// Another device of the same user disconnected or was reaped.
    pub const DEVICE_DISCONNECTED: &str = "device:disconnected";
    /// Reply to the sender when an inbound frame could not be handled.
    pub const ERROR: &str = "error";

    /// Goal progress changed.
    pub const GOAL_PROGRESS_UPDATED: &str = "goal:progress-updated";
    /// Goal reached the completed state.
    pub const GOAL_COMPLETED: &str = "goal:completed";
    /// Goal was paused.
    pub const GOAL_PAUSED: &str = "goal:paused";
    /// Goal was resumed.
    pub const GOAL_RESUMED: &str = "goal:resumed";
    /// Goal was cancelled.
    pub const GOAL_CANCELLED: &str = "goal:cancelled";
    /// Goal was marked failed.
    pub const GOAL_FAILED: &str = "goal:failed";

    /// Health metric recorded on another device.
    pub const HEALTH_DATA_UPDATED: &str = "health-data:updated";
    /// Workout started on another device.
    pub const WORKOUT_STARTED: &str = "workout:started";
    /// Workout changed on another device.
    pub const WORKOUT_UPDATED: &str = "workout:updated";
    /// Workout finished on another device.
    pub const WORKOUT_COMPLETED: &str = "workout:completed";
    /// Notification marked read on another device.
    pub const NOTIFICATION_READ: &str = "notification:read";
    /// Typing indicator started.
    pub const TYPING_START: &str = "typing:start";
    /// Typing indicator stopped.
    pub const TYPING_STOP: &str = "typing:stop";
    /// A device asks its siblings for state.
    pub const SYNC_REQUEST: &str = "sync:request";
    /// A device answers a sync request.
    pub const SYNC_RESPONSE: &str = "sync:response";
    /// Presence changed on another device.
    pub const PRESENCE_UPDATED: &str = "presence:updated";
    /// Application-defined event relayed verbatim.
    pub const CUSTOM_EVENT: &str = "custom:event";
}

/// Who on the user channel receives an event caused by one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryScope {
    /// Every live connection, the originating one included.
    IncludeSender,
    /// Every live connection except the originating one.
    ExcludeSender,
}

/// Sender-inclusion policy for an outbound event type.
///
/// Server-authoritative state (goal transitions, errors) goes to the sender
/// too, since the sender learns the computed result from it. Device echoes
/// go only to the sibling devices.
pub fn delivery_scope(event_type: &str) -> DeliveryScope {
    if event_type.starts_with("goal:")
        || event_type == names::ERROR
        || event_type == names::CONNECTION_ESTABLISHED
    {
        DeliveryScope::IncludeSender
    } else {
        DeliveryScope::ExcludeSender
    }
}

/// A typed notification addressed to one user's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Wire event name, e.g. `goal:completed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Owner of the channel the event is published to.
    pub user_id: UserId,
    /// Event body.
    pub payload: Value,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Connection that must not receive the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_connection_id: Option<ConnectionId>,
}

impl DomainEvent {
    /// Build an event delivered to the whole channel.
    pub fn new(
        event_type: impl Into<String>,
        user_id: UserId,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            user_id,
            payload,
            timestamp,
            exclude_connection_id: None,
        }
    }

    /// Apply the sender policy for this event type given the connection
    /// that caused it. Events with no originating connection reach everyone.
    #[must_use]
    pub fn with_origin(mut self, origin: Option<&ConnectionId>) -> Self {
        self.exclude_connection_id = match (origin, delivery_scope(&self.event_type)) {
            (Some(id), DeliveryScope::ExcludeSender) => Some(id.clone()),
            _ => None,
        };
        self
    }

    /// The `{type, payload, timestamp}` frame sent to devices.
    pub fn envelope(&self) -> Envelope<'_> {
        Envelope {
            event_type: &self.event_type,
            payload: &self.payload,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Outbound wire frame.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    /// Event name.
    #[serde(rename = "type")]
    pub event_type: &'a str,
    /// Event body.
    pub payload: &'a Value,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
}

/// Destination for domain events.
///
/// Implemented by the fan-out bus; the goal machine only sees this trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver `events` in order, all addressed to the same user. Returns the
    /// number of frames delivered.
    async fn emit(&self, events: Vec<DomainEvent>) -> usize;
}

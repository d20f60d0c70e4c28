//! Inbound device frames: parsing and routing.
//!
//! Device echoes (health data, workouts, typing, presence, ...) are relayed
//! to the sender's sibling devices with an `origin` block attached. Goal
//! progress goes through [`GoalService`], which publishes the resulting
//! transition itself.

use std::sync::Arc;

use metrics::counter;
use pulse_core::events::names;
use pulse_core::{ConnectionId, GoalId};
use pulse_goals::{Goal, GoalError, GoalEvent, GoalService};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use super::bus::FanoutBus;
use super::connection::DeviceConnection;
use crate::metrics::SYNC_INBOUND_EVENTS_TOTAL;

/// Inbound event names.
pub mod inbound {
    /// Health metric recorded on a device.
    pub const HEALTH_DATA_UPDATE: &str = "health-data:update";
    /// Progress reported against a goal.
    pub const GOAL_PROGRESS: &str = "goal:progress";
    /// Workout started.
    pub const WORKOUT_START: &str = "workout:start";
    /// Workout changed.
    pub const WORKOUT_UPDATE: &str = "workout:update";
    /// Workout finished.
    pub const WORKOUT_COMPLETE: &str = "workout:complete";
    /// Notification marked read.
    pub const NOTIFICATION_READ: &str = "notification:read";
    /// Typing indicator started.
    pub const TYPING_START: &str = "typing:start";
    /// Typing indicator stopped.
    pub const TYPING_STOP: &str = "typing:stop";
    /// Ask sibling devices for state.
    pub const SYNC_REQUEST: &str = "sync:request";
    /// Answer a sibling's sync request.
    pub const SYNC_RESPONSE: &str = "sync:response";
    /// Presence changed.
    pub const PRESENCE_UPDATE: &str = "presence:update";
    /// Application-defined event.
    pub const CUSTOM_EVENT: &str = "custom:event";
}

/// Why an inbound frame was not handled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Not a JSON `{type, payload}` object.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// `type` is not one the server handles.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// Payload has the wrong shape for its event type.
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Inbound event name.
        event: String,
        /// What was wrong.
        reason: String,
    },

    /// The connection is not (or no longer) registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Goal transition rejected.
    #[error(transparent)]
    Goal(#[from] GoalError),
}

impl DispatchError {
    /// Machine-readable code for `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            Self::Goal(e) => e.code(),
        }
    }
}

/// Raw inbound frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    /// Event name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event body; absent means `null`.
    #[serde(default)]
    pub payload: Value,
}

impl InboundFrame {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, DispatchError> {
        serde_json::from_str(text).map_err(|e| DispatchError::MalformedFrame(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoalProgressPayload {
    goal_id: GoalId,
    value: f64,
    #[serde(default)]
    percentage: Option<f64>,
    #[serde(default)]
    note: Option<String>,
}

/// Inbound events relayed to sibling devices, with their outbound names.
const RELAYED: &[(&str, &str)] = &[
    (inbound::HEALTH_DATA_UPDATE, names::HEALTH_DATA_UPDATED),
    (inbound::WORKOUT_START, names::WORKOUT_STARTED),
    (inbound::WORKOUT_UPDATE, names::WORKOUT_UPDATED),
    (inbound::WORKOUT_COMPLETE, names::WORKOUT_COMPLETED),
    (inbound::NOTIFICATION_READ, names::NOTIFICATION_READ),
    (inbound::TYPING_START, names::TYPING_START),
    (inbound::TYPING_STOP, names::TYPING_STOP),
    (inbound::SYNC_REQUEST, names::SYNC_REQUEST),
    (inbound::PRESENCE_UPDATE, names::PRESENCE_UPDATED),
    (inbound::CUSTOM_EVENT, names::CUSTOM_EVENT),
];

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Relay to the sender's other devices under `outbound`.
    Relay {
        /// Inbound name.
        inbound: &'static str,
        /// Outbound name.
        outbound: &'static str,
        /// Object payload, relayed as is plus `origin`.
        payload: Map<String, Value>,
    },
    /// Progress against a goal.
    GoalProgress {
        /// Target goal.
        goal_id: GoalId,
        /// The `updateProgress` event to apply.
        event: GoalEvent,
    },
    /// Reply to a sync request, routed to the requester when it is known.
    SyncResponse {
        /// Connection that asked, if given.
        requester: Option<ConnectionId>,
        /// Object payload.
        payload: Map<String, Value>,
    },
}

impl InboundEvent {
    /// Validate `payload` for `event_type`.
    pub fn parse(event_type: &str, payload: Value) -> Result<Self, DispatchError> {
        match event_type {
            inbound::GOAL_PROGRESS => {
                let p: GoalProgressPayload =
                    serde_json::from_value(payload).map_err(|e| DispatchError::InvalidPayload {
                        event: inbound::GOAL_PROGRESS.to_owned(),
                        reason: e.to_string(),
                    })?;
                Ok(Self::GoalProgress {
                    goal_id: p.goal_id,
                    event: GoalEvent::UpdateProgress {
                        value: p.value,
                        percentage: p.percentage,
                        note: p.note,
                    },
                })
            }
            inbound::SYNC_RESPONSE => {
                let mut payload = object(inbound::SYNC_RESPONSE, payload)?;
                let requester = match payload.remove("requesterId") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(id)) => Some(ConnectionId::from(id)),
                    Some(_) => {
                        return Err(DispatchError::InvalidPayload {
                            event: inbound::SYNC_RESPONSE.to_owned(),
                            reason: "requesterId must be a string".to_owned(),
                        });
                    }
                };
                Ok(Self::SyncResponse { requester, payload })
            }
            other => {
                let Some(&(name, outbound)) = RELAYED.iter().find(|(name, _)| *name == other)
                else {
                    return Err(DispatchError::UnknownEvent(other.to_owned()));
                };
                Ok(Self::Relay {
                    inbound: name,
                    outbound,
                    payload: object(name, payload)?,
                })
            }
        }
    }

    /// Inbound event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Relay { inbound, .. } => *inbound,
            Self::GoalProgress { .. } => inbound::GOAL_PROGRESS,
            Self::SyncResponse { .. } => inbound::SYNC_RESPONSE,
        }
    }
}

/// `null` becomes an empty object; anything else must already be one.
fn object(event: &str, payload: Value) -> Result<Map<String, Value>, DispatchError> {
    match payload {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        _ => Err(DispatchError::InvalidPayload {
            event: event.to_owned(),
            reason: "payload must be a JSON object".to_owned(),
        }),
    }
}

/// What handling an inbound event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Relayed to this many connections.
    Relayed(usize),
    /// Goal transition applied and published.
    Goal(Box<Goal>),
}

/// Routes validated inbound events.
pub struct Dispatcher {
    bus: Arc<FanoutBus>,
    goals: Arc<GoalService>,
}

impl Dispatcher {
    /// Dispatcher publishing through `bus` and applying goal progress via
    /// `goals`.
    pub fn new(bus: Arc<FanoutBus>, goals: Arc<GoalService>) -> Self {
        Self { bus, goals }
    }

    /// Handle `event` sent by `sender`.
    #[instrument(
        skip_all,
        fields(user_id = %sender.user_id(), connection_id = %sender.id(), event = event.name())
    )]
    pub async fn dispatch(
        &self,
        sender: &DeviceConnection,
        event: InboundEvent,
    ) -> Result<Dispatched, DispatchError> {
        counter!(SYNC_INBOUND_EVENTS_TOTAL, "type" => event.name()).increment(1);
        let user_id = sender.user_id();

        match event {
            InboundEvent::Relay {
                inbound: name,
                outbound,
                mut payload,
            } => {
                let _ = payload.insert("origin".to_owned(), origin(sender));
                if name == inbound::SYNC_REQUEST {
                    let _ = payload.insert("requesterId".to_owned(), json!(sender.id()));
                }
                let delivered = self
                    .bus
                    .publish_from(sender, outbound, Value::Object(payload))
                    .await;
                debug!(outbound, delivered, "inbound event relayed");
                Ok(Dispatched::Relayed(delivered))
            }
            InboundEvent::GoalProgress { goal_id, event } => {
                let goal = self
                    .goals
                    .apply(user_id, &goal_id, event, Some(sender.id()))
                    .await?;
                Ok(Dispatched::Goal(Box::new(goal)))
            }
            InboundEvent::SyncResponse {
                requester,
                mut payload,
            } => {
                let _ = payload.insert("origin".to_owned(), origin(sender));
                let payload = Value::Object(payload);
                let target = requester.filter(|id| {
                    id != sender.id()
                        && self
                            .bus
                            .registry()
                            .get(id)
                            .is_some_and(|c| c.user_id() == user_id)
                });
                let delivered = match target {
                    Some(id) => {
                        usize::from(self.bus.send_to(user_id, &id, names::SYNC_RESPONSE, payload).await)
                    }
                    None => {
                        self.bus
                            .publish_from(sender, names::SYNC_RESPONSE, payload)
                            .await
                    }
                };
                debug!(delivered, "sync response routed");
                Ok(Dispatched::Relayed(delivered))
            }
        }
    }
}

fn origin(sender: &DeviceConnection) -> Value {
    json!({
        "connectionId": sender.id(),
        "device": sender.device(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connection::ConnectionHandle;
    use crate::sync::registry::ConnectionRegistry;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use pulse_core::{Clock, ManualClock, UserId};
    use pulse_goals::{
        GoalStatus, GoalTarget, GoalType, InMemoryGoalStore, MilestonePolicy, Timeframe,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Rx = mpsc::Receiver<Arc<String>>;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        store: Arc<InMemoryGoalStore>,
        clock: Arc<ManualClock>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(clock.clone()));
        let bus = Arc::new(FanoutBus::new(
            registry.clone(),
            clock.clone(),
            Duration::from_millis(100),
        ));
        let store = Arc::new(InMemoryGoalStore::new());
        let goals = Arc::new(GoalService::new(
            store.clone(),
            bus.clone(),
            MilestonePolicy::default(),
            clock.clone(),
        ));
        Fixture {
            registry,
            store,
            clock,
            dispatcher: Dispatcher::new(bus, goals),
        }
    }

    fn connect(f: &Fixture, user: &str, device: &str) -> (Arc<DeviceConnection>, Rx) {
        let (handle, rx) = ConnectionHandle::channel(8);
        let id = f
            .registry
            .register(&user.into(), handle.with_device(Some(device.into())));
        (f.registry.get(&id).unwrap(), rx)
    }

    fn frames(rx: &mut Rx) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[test]
    fn frame_without_payload_defaults_to_null() {
        let frame = InboundFrame::parse(r#"{"type":"typing:stop"}"#).unwrap();
        assert_eq!(frame.event_type, "typing:stop");
        assert_eq!(frame.payload, Value::Null);
    }

    #[test]
    fn garbage_frame_is_malformed() {
        assert_matches!(InboundFrame::parse("not json"), Err(DispatchError::MalformedFrame(_)));
        assert_matches!(
            InboundFrame::parse(r#"{"payload":{}}"#),
            Err(DispatchError::MalformedFrame(_))
        );
    }

    #[test]
    fn every_handled_type_parses() {
        for name in [
            inbound::HEALTH_DATA_UPDATE,
            inbound::WORKOUT_START,
            inbound::WORKOUT_UPDATE,
            inbound::WORKOUT_COMPLETE,
            inbound::NOTIFICATION_READ,
            inbound::TYPING_START,
            inbound::TYPING_STOP,
            inbound::SYNC_REQUEST,
            inbound::SYNC_RESPONSE,
            inbound::PRESENCE_UPDATE,
            inbound::CUSTOM_EVENT,
        ] {
            let event = InboundEvent::parse(name, json!({})).unwrap();
            assert_eq!(event.name(), name);
        }
        let goal = InboundEvent::parse(inbound::GOAL_PROGRESS, json!({"goalId": "g1", "value": 5}))
            .unwrap();
        assert_eq!(goal.name(), inbound::GOAL_PROGRESS);
    }

    #[test]
    fn unknown_type_rejected() {
        let err = InboundEvent::parse("chat:message", json!({})).unwrap_err();
        assert_eq!(err, DispatchError::UnknownEvent("chat:message".into()));
        assert_eq!(err.code(), "UNKNOWN_EVENT");
    }

    #[test]
    fn non_object_payload_rejected() {
        let err = InboundEvent::parse(inbound::HEALTH_DATA_UPDATE, json!([1, 2])).unwrap_err();
        assert_matches!(err, DispatchError::InvalidPayload { ref event, .. } if event == "health-data:update");
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn goal_progress_requires_goal_and_value() {
        assert_matches!(
            InboundEvent::parse(inbound::GOAL_PROGRESS, json!({"value": 3})),
            Err(DispatchError::InvalidPayload { .. })
        );
        assert_matches!(
            InboundEvent::parse(inbound::GOAL_PROGRESS, json!({"goalId": "g1", "value": "lots"})),
            Err(DispatchError::InvalidPayload { .. })
        );
        let event = InboundEvent::parse(
            inbound::GOAL_PROGRESS,
            json!({"goalId": "g1", "value": 12.5, "note": "halfway"}),
        )
        .unwrap();
        assert_matches!(
            event,
            InboundEvent::GoalProgress {
                goal_id,
                event: GoalEvent::UpdateProgress { value, percentage: None, note: Some(_) },
            } if goal_id.as_str() == "g1" && (value - 12.5).abs() < f64::EPSILON
        );
    }

    #[test]
    fn sync_response_requester_must_be_string() {
        assert_matches!(
            InboundEvent::parse(inbound::SYNC_RESPONSE, json!({"requesterId": 7})),
            Err(DispatchError::InvalidPayload { .. })
        );
        let event =
            InboundEvent::parse(inbound::SYNC_RESPONSE, json!({"requesterId": "conn_x", "a": 1}))
                .unwrap();
        assert_matches!(
            event,
            InboundEvent::SyncResponse { requester: Some(id), payload }
                if id.as_str() == "conn_x" && !payload.contains_key("requesterId")
        );
    }

    #[tokio::test]
    async fn relay_excludes_sender_and_tags_origin() {
        let f = fixture();
        let (phone, mut rx_phone) = connect(&f, "u1", "ios");
        let (_web, mut rx_web) = connect(&f, "u1", "web");
        let (_other, mut rx_other) = connect(&f, "u2", "ios");

        let event =
            InboundEvent::parse(inbound::HEALTH_DATA_UPDATE, json!({"metric": "steps", "value": 4200}))
                .unwrap();
        let out = f.dispatcher.dispatch(&phone, event).await.unwrap();
        assert_eq!(out, Dispatched::Relayed(1));

        let web = frames(&mut rx_web);
        assert_eq!(web.len(), 1);
        assert_eq!(web[0]["type"], "health-data:updated");
        assert_eq!(web[0]["payload"]["metric"], "steps");
        assert_eq!(web[0]["payload"]["origin"]["connectionId"], phone.id().as_str());
        assert_eq!(web[0]["payload"]["origin"]["device"], "ios");
        assert!(frames(&mut rx_phone).is_empty());
        assert!(frames(&mut rx_other).is_empty());
    }

    #[tokio::test]
    async fn sync_request_carries_requester() {
        let f = fixture();
        let (phone, _rx_phone) = connect(&f, "u1", "ios");
        let (_web, mut rx_web) = connect(&f, "u1", "web");

        let event = InboundEvent::parse(inbound::SYNC_REQUEST, Value::Null).unwrap();
        let _ = f.dispatcher.dispatch(&phone, event).await.unwrap();
        let web = frames(&mut rx_web);
        assert_eq!(web[0]["type"], "sync:request");
        assert_eq!(web[0]["payload"]["requesterId"], phone.id().as_str());
    }

    #[tokio::test]
    async fn sync_response_goes_only_to_requester() {
        let f = fixture();
        let (phone, mut rx_phone) = connect(&f, "u1", "ios");
        let (web, mut rx_web) = connect(&f, "u1", "web");
        let (_tablet, mut rx_tablet) = connect(&f, "u1", "tablet");

        let event = InboundEvent::parse(
            inbound::SYNC_RESPONSE,
            json!({"requesterId": phone.id(), "state": {"steps": 10}}),
        )
        .unwrap();
        let out = f.dispatcher.dispatch(&web, event).await.unwrap();
        assert_eq!(out, Dispatched::Relayed(1));

        let phone_frames = frames(&mut rx_phone);
        assert_eq!(phone_frames.len(), 1);
        assert_eq!(phone_frames[0]["type"], "sync:response");
        assert_eq!(phone_frames[0]["payload"]["state"]["steps"], 10);
        assert!(frames(&mut rx_tablet).is_empty());
        assert!(frames(&mut rx_web).is_empty());
    }

    #[tokio::test]
    async fn sync_response_to_foreign_requester_is_broadcast_to_siblings() {
        let f = fixture();
        let (stranger, mut rx_stranger) = connect(&f, "u2", "ios");
        let (web, _rx_web) = connect(&f, "u1", "web");
        let (_phone, mut rx_phone) = connect(&f, "u1", "ios");

        let event = InboundEvent::parse(
            inbound::SYNC_RESPONSE,
            json!({"requesterId": stranger.id()}),
        )
        .unwrap();
        let out = f.dispatcher.dispatch(&web, event).await.unwrap();
        assert_eq!(out, Dispatched::Relayed(1));
        assert!(frames(&mut rx_stranger).is_empty());
        assert_eq!(frames(&mut rx_phone).len(), 1);
    }

    #[tokio::test]
    async fn goal_progress_reaches_every_device() {
        let f = fixture();
        let goal = pulse_goals::Goal::new(
            UserId::from("u1"),
            "Run 65 km",
            GoalType::Target,
            GoalTarget {
                value: 65.0,
                unit: "km".into(),
            },
            Timeframe {
                start: f.clock.now(),
                end: None,
            },
            f.clock.now(),
        );
        let goal_id = goal.id.clone();
        let _ = f.store.insert(goal);

        let (phone, mut rx_phone) = connect(&f, "u1", "ios");
        let (_web, mut rx_web) = connect(&f, "u1", "web");

        let event = InboundEvent::parse(
            inbound::GOAL_PROGRESS,
            json!({"goalId": goal_id, "value": 65}),
        )
        .unwrap();
        let out = f.dispatcher.dispatch(&phone, event).await.unwrap();
        assert_matches!(out, Dispatched::Goal(g) if g.status == GoalStatus::Completed);

        for rx in [&mut rx_phone, &mut rx_web] {
            let types: Vec<_> = frames(rx).iter().map(|f| f["type"].clone()).collect();
            assert_eq!(types, vec![json!("goal:progress-updated"), json!("goal:completed")]);
        }
    }

    #[tokio::test]
    async fn goal_progress_on_missing_goal_is_goal_error() {
        let f = fixture();
        let (phone, _rx) = connect(&f, "u1", "ios");
        let event =
            InboundEvent::parse(inbound::GOAL_PROGRESS, json!({"goalId": "nope", "value": 1}))
                .unwrap();
        let err = f.dispatcher.dispatch(&phone, event).await.unwrap_err();
        assert_eq!(err.code(), "GOAL_NOT_FOUND");
    }
}

//! # pulse-core
//!
//! Shared vocabulary for the Pulse sync workspace:
//!
//! - **Ids**: `UserId`, `ConnectionId`, `GoalId` as newtypes for type safety
//! - **Clock**: injectable time source so idle and progress timestamps are testable
//! - **Events**: `DomainEvent`, wire event names, per-type sender policy, `EventSink`
//! - **Logging**: `tracing-subscriber` setup shared by binaries and tests

#![deny(unsafe_code)]

pub mod clock;
pub mod events;
pub mod ids;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{DeliveryScope, DomainEvent, EventSink, delivery_scope};
pub use ids::{ConnectionId, GoalId, UserId};

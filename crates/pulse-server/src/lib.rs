//! # pulse-server
//!
//! Real-time multi-device sync for Pulse.
//!
//! - **Sync**: per-user [`ConnectionRegistry`](sync::ConnectionRegistry),
//!   [`FanoutBus`](sync::FanoutBus) with sender exclusion and bounded
//!   per-connection sends, [`IdleReaper`](sync::IdleReaper), inbound dispatch
//! - **Hub**: [`SyncHub`] ties the handshake, the registry, the bus and the
//!   goal service together, independent of the transport
//! - **Server**: Axum `/ws`, `/health` and `/metrics`, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod sync;
pub mod websocket;

pub use config::ServerConfig;
pub use hub::SyncHub;
pub use server::SyncServer;
pub use shutdown::{DrainReport, ShutdownCoordinator};

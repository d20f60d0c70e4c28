//! Per-user connection registry, event fan-out, idle reaping and inbound
//! dispatch.

pub mod bus;
pub mod connection;
pub mod dispatch;
pub mod reaper;
pub mod registry;

pub use bus::FanoutBus;
pub use connection::{
    ConnectionHandle, ConnectionInfo, ConnectionStatus, DeliveryFailure, DeviceConnection,
};
pub use dispatch::{DispatchError, Dispatched, Dispatcher, InboundEvent, InboundFrame};
pub use reaper::{IdleReaper, ReaperHandle};
pub use registry::{ConnectionRegistry, RegistryError};

//! WebSocket transport: one session task per device.

pub mod session;

pub use session::{SessionOptions, run_ws_session};

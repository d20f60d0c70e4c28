//! WebSocket session lifecycle: one authenticated device from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use metrics::histogram;
use pulse_auth::Principal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::ServerConfig;
use crate::hub::SyncHub;
use crate::metrics::SYNC_SESSION_DURATION_SECONDS;
use crate::sync::{ConnectionHandle, DispatchError};

/// How long the writer gets to flush a Close frame after the session ends.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Per-session transport settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Outbound queue depth.
    pub outbound_buffer: usize,
    /// Period of server Ping frames.
    pub ping_interval: Duration,
}

impl From<&ServerConfig> for SessionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            ping_interval: config.ping_interval(),
        }
    }
}

/// What an inbound WebSocket message means for the session.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Frame(String),
    Skip,
    Close,
}

fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Text(text) => Inbound::Frame(text.as_str().to_owned()),
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => Inbound::Frame(text.to_owned()),
            Err(_) => {
                debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                Inbound::Skip
            }
        },
        // protocol keepalive, not application activity
        Message::Ping(_) | Message::Pong(_) => Inbound::Skip,
        Message::Close(_) => Inbound::Close,
    }
}

/// Run a session for an authenticated device.
///
/// 1. Registers the device through the hub (greeting and sibling notice)
/// 2. Forwards queued outbound frames and sends periodic Pings
/// 3. Dispatches inbound text frames
/// 4. Ends when the peer goes away or the connection is force-closed
///    (reaped, dropped by the bus, server shutdown)
/// 5. Unregisters and tells the remaining devices
#[instrument(skip_all, fields(user_id = %principal.user_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    principal: Principal,
    device: Option<String>,
    hub: Arc<SyncHub>,
    options: SessionOptions,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let close = shutdown.child_token();
    let (handle, mut send_rx) = ConnectionHandle::channel(options.outbound_buffer);
    let handle = handle.with_device(device).with_close_token(close.clone());

    let outbound_close = close.clone();
    let outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(options.ping_interval);
        // first tick completes immediately
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_close.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: Utf8Bytes::from_static("connection closed by server"),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let id = hub.admit(&principal, handle).await;
    let started = Instant::now();

    loop {
        let msg = tokio::select! {
            () = close.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let Some(Ok(msg)) = msg else { break };

        let text = match classify(msg) {
            Inbound::Frame(text) => text,
            Inbound::Skip => continue,
            Inbound::Close => {
                debug!(connection_id = %id, "peer sent close frame");
                break;
            }
        };

        match hub.on_frame(&id, &text).await {
            Ok(_) => {}
            Err(DispatchError::UnknownConnection(_)) => break,
            // already answered with an error frame
            Err(e) => debug!(connection_id = %id, code = e.code(), "inbound frame failed"),
        }
    }

    let reason = if shutdown.is_cancelled() {
        "shutdown"
    } else {
        "closed"
    };
    let _ = hub.disconnect(&id, reason).await;
    histogram!(SYNC_SESSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(connection_id = %id, reason, "session ended");

    close.cancel();
    let abort = outbound.abort_handle();
    if tokio::time::timeout(CLOSE_GRACE, outbound).await.is_err() {
        abort.abort();
    }
}

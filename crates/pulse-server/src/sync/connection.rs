//! Per-device connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pulse_core::clock::elapsed_between;
use pulse_core::events::names;
use pulse_core::{ConnectionId, DomainEvent, UserId};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

/// Whether a connection can still receive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Registered and writable.
    Open,
    /// Unregistered, reaped or failed; never reopens.
    Closed,
}

/// Why a frame could not be handed to a connection's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The connection is closed or its writer is gone.
    #[error("connection closed")]
    Closed,
    /// The outbound queue stayed full for the whole send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Transport side of a connection, handed to the registry on admission.
///
/// The registry writes outbound frames into `tx`; the socket task drains the
/// matching receiver and watches `close` to tear the socket down.
#[derive(Debug)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Arc<String>>,
    close: CancellationToken,
    device: Option<String>,
}

impl ConnectionHandle {
    /// A handle with an outbound queue of `capacity` frames.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            tx,
            close: CancellationToken::new(),
            device: None,
        };
        (handle, rx)
    }

    /// Label the device (e.g. `"ios"`, `"web"`).
    #[must_use]
    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    /// Use `token` as the close signal, typically a child of the server's
    /// shutdown token.
    #[must_use]
    pub fn with_close_token(mut self, token: CancellationToken) -> Self {
        self.close = token;
        self
    }

    /// Token cancelled when the connection is force-closed.
    pub fn close_signal(&self) -> CancellationToken {
        self.close.clone()
    }
}

#[derive(Debug)]
struct Activity {
    last: DateTime<Utc>,
    status: ConnectionStatus,
}

/// A live device connection owned by the registry.
#[derive(Debug)]
pub struct DeviceConnection {
    id: ConnectionId,
    user_id: UserId,
    device: Option<String>,
    established_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    tx: mpsc::Sender<Arc<String>>,
    close: CancellationToken,
    failed_sends: AtomicU64,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Owner.
    pub user_id: UserId,
    /// Device label.
    pub device: Option<String>,
    /// When it was admitted.
    pub established_at: DateTime<Utc>,
    /// Last inbound application activity.
    pub last_activity_at: DateTime<Utc>,
    /// Open or closed.
    pub status: ConnectionStatus,
}

impl DeviceConnection {
    pub(crate) fn new(
        id: ConnectionId,
        user_id: UserId,
        handle: ConnectionHandle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            device: handle.device,
            established_at: now,
            activity: Mutex::new(Activity {
                last: now,
                status: ConnectionStatus::Open,
            }),
            tx: handle.tx,
            close: handle.close,
            failed_sends: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Device label.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// When the connection was admitted.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Last inbound application activity.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.activity.lock().last
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.activity.lock().status
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// How long the connection has been quiet as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.last_activity_at(), now)
    }

    /// Failed deliveries so far.
    pub fn failed_sends(&self) -> u64 {
        self.failed_sends.load(Ordering::Relaxed)
    }

    /// Snapshot for payloads and diagnostics.
    pub fn info(&self) -> ConnectionInfo {
        let activity = self.activity.lock();
        ConnectionInfo {
            connection_id: self.id.clone(),
            user_id: self.user_id.clone(),
            device: self.device.clone(),
            established_at: self.established_at,
            last_activity_at: activity.last,
            status: activity.status,
        }
    }

    /// `device:disconnected` for this connection's siblings.
    pub fn disconnected_event(&self, reason: &str, now: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            names::DEVICE_DISCONNECTED,
            self.user_id.clone(),
            json!({
                "connectionId": self.id,
                "device": self.device,
                "reason": reason,
            }),
            now,
        )
        .with_origin(Some(&self.id))
    }

    /// Record inbound activity. Returns `false` once the connection is closed.
    pub(crate) fn touch(&self, now: DateTime<Utc>) -> bool {
        let mut activity = self.activity.lock();
        if activity.status == ConnectionStatus::Closed {
            return false;
        }
        if now > activity.last {
            activity.last = now;
        }
        true
    }

    /// Close the connection if it has been idle for longer than `threshold`.
    ///
    /// The check and the close happen under one lock so a concurrent
    /// [`touch`](Self::touch) either lands first and saves the connection or
    /// lands after and sees it closed.
    pub(crate) fn close_if_idle(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let mut activity = self.activity.lock();
        if activity.status == ConnectionStatus::Closed
            || elapsed_between(activity.last, now) <= threshold
        {
            return false;
        }
        activity.status = ConnectionStatus::Closed;
        drop(activity);
        self.close.cancel();
        true
    }

    /// Mark closed and signal the transport to shut down. Idempotent.
    pub(crate) fn close(&self) {
        self.activity.lock().status = ConnectionStatus::Closed;
        self.close.cancel();
    }

    /// Queue a frame for the socket writer, waiting at most `timeout` for
    /// room in the outbound queue.
    pub(crate) async fn deliver(
        &self,
        frame: Arc<String>,
        timeout: Duration,
    ) -> Result<(), DeliveryFailure> {
        if !self.is_open() {
            return Err(DeliveryFailure::Closed);
        }
        let result = match self.tx.send_timeout(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryFailure::Closed),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryFailure::Timeout(timeout)),
        };
        if result.is_err() {
            let _ = self.failed_sends.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

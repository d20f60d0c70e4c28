//! Periodic removal of idle connections.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::bus::FanoutBus;
use super::registry::ConnectionRegistry;
use crate::metrics::{SYNC_DISCONNECTIONS_TOTAL, SYNC_REAPED_TOTAL};

/// Disconnects connections with no application activity for longer than a
/// threshold and tells the user's other devices.
pub struct IdleReaper {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<FanoutBus>,
    threshold: Duration,
    interval: Duration,
}

impl IdleReaper {
    /// Reaper sweeping every `interval` for connections idle longer than
    /// `threshold`. Time comes from the registry's clock.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<FanoutBus>,
        threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            threshold,
            interval,
        }
    }

    /// Run one sweep. Returns the number of connections reaped.
    ///
    /// Works from a snapshot and re-checks each candidate when removing it;
    /// no registry-wide lock is held across the sweep.
    pub async fn sweep(&self) -> usize {
        let candidates = self.registry.snapshot();
        let scanned = candidates.len();
        let mut reaped = 0;

        for conn in candidates {
            if conn.idle_for(self.registry.now()) <= self.threshold {
                continue;
            }
            let Some(conn) =
                self.registry
                    .remove_if_idle(conn.id(), self.threshold, self.registry.now())
            else {
                continue;
            };

            reaped += 1;
            counter!(SYNC_REAPED_TOTAL).increment(1);
            counter!(SYNC_DISCONNECTIONS_TOTAL, "reason" => "idle").increment(1);
            info!(
                user_id = %conn.user_id(),
                connection_id = %conn.id(),
                last_activity_at = %conn.last_activity_at(),
                "reaped idle connection"
            );

            let notice = conn.disconnected_event("idle", self.registry.now());
            let _ = self.bus.publish_batch(conn.user_id(), vec![notice]).await;
        }

        if let Err(e) = self.registry.verify_consistency() {
            error!(error = %e, "connection registry consistency violation");
        }
        debug!(scanned, reaped, "idle sweep finished");
        reaped
    }

    /// Spawn the periodic sweep. It stops when `cancel` fires or the handle
    /// is stopped.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> ReaperHandle {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            let _ = ticker.tick().await;
            info!(
                interval_secs = self.interval.as_secs(),
                threshold_secs = self.threshold.as_secs(),
                "idle reaper started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.sweep().await;
                    }
                }
            }
            info!("idle reaper stopped");
        });
        ReaperHandle { cancel, task }
    }
}

/// Owner of a running reaper task.
pub struct ReaperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop sweeping and wait for the task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    /// Give up ownership of the task, e.g. to a shutdown coordinator. The
    /// task still stops when its token is cancelled.
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

//! # pulse-daemon
//!
//! Pulse sync server binary: loads settings, wires the handshake, the goal
//! store and the hub together, and serves devices until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_auth::{AuthHandshake, CredentialVerifier, JwtVerifier, StaticVerifier};
use pulse_core::SystemClock;
use pulse_core::logging::init_subscriber;
use pulse_goals::{InMemoryGoalStore, MilestonePolicy};
use pulse_server::{ServerConfig, SyncHub, SyncServer};
use pulse_settings::{AuthSettings, PulseSettings, load_settings_from_path, settings_path};
use tracing::{info, warn};

/// Pulse real-time sync server.
#[derive(Parser, Debug)]
#[command(name = "pulse-daemon", about = "Pulse real-time sync server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.pulse/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `pulse_server=trace` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Seconds to wait for sessions and background tasks on shutdown.
    #[arg(long, default_value = "30")]
    shutdown_timeout_secs: u64,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(settings_path)
    }

    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut PulseSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

/// JWT verification when a secret is configured. Without one, every
/// credential is refused.
fn build_verifier(auth: &AuthSettings) -> Arc<dyn CredentialVerifier> {
    let Some(secret) = auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) else {
        warn!("auth.jwtSecret is not set; all connections will be refused");
        return Arc::new(StaticVerifier::new());
    };

    let mut verifier = JwtVerifier::new(secret.as_bytes()).with_leeway(auth.leeway_secs);
    if let Some(issuer) = &auth.issuer {
        verifier = verifier.with_issuer(issuer);
    }
    if let Some(audience) = &auth.audience {
        verifier = verifier.with_audience(audience);
    }
    Arc::new(verifier)
}

fn build_server(settings: &PulseSettings) -> SyncServer {
    let config = ServerConfig::from_settings(settings);
    let hub = Arc::new(SyncHub::new(
        AuthHandshake::new(build_verifier(&settings.auth)),
        Arc::new(InMemoryGoalStore::new()),
        MilestonePolicy::from(&settings.goals),
        Arc::new(SystemClock),
        config.send_timeout(),
    ));
    SyncServer::new(config, hub)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings_path();
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = pulse_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = build_server(&settings).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind listener")?;

    info!(
        %addr,
        idle_threshold_secs = server.config().idle_threshold_secs,
        reap_interval_secs = server.config().reap_interval_secs,
        "pulse daemon listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("shutting down");
    server
        .shutdown_gracefully(
            vec![handle],
            Some(Duration::from_secs(args.shutdown_timeout_secs)),
        )
        .await;
    info!("shutdown complete");
    Ok(())
}

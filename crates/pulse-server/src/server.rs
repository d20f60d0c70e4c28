//! `SyncServer`: Axum HTTP + WebSocket front end over a [`SyncHub`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::hub::SyncHub;
use crate::metrics::{self as server_metrics, SYNC_UPGRADE_REFUSALS_TOTAL};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{SessionOptions, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Registry, bus and goal service.
    pub hub: Arc<SyncHub>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Query parameters accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Credential, for clients that cannot set headers.
    pub token: Option<String>,
    /// Device label, e.g. `ios`.
    pub device: Option<String>,
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    hub: Arc<SyncHub>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl SyncServer {
    /// Create a server over `hub`.
    pub fn new(config: ServerConfig, hub: Arc<SyncHub>) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind, start the idle reaper and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;

        let reaper = Arc::new(
            self.hub
                .reaper(self.config.idle_threshold(), self.config.reap_interval()),
        )
        .start(self.shutdown.child_token());
        self.shutdown.track(reaper.into_task());

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });

        info!(%addr, "pulse sync server listening");
        Ok((addr, handle))
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Drain: cancel everything, then wait for `extra` plus the server's own
    /// background tasks, aborting any still running after `timeout`.
    pub async fn shutdown_gracefully(&self, extra: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        for task in extra {
            self.shutdown.track(task);
        }
        let report = self.shutdown.drain(timeout).await;
        info!(
            finished = report.finished,
            aborted = report.aborted,
            "pulse sync server stopped"
        );
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.hub.registry();
    Json(health::health_check(
        state.start_time,
        registry.connection_count(),
        registry.user_count(),
        state.shutdown.is_draining(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            server_metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn refuse(status: StatusCode, error: &'static str, message: String) -> Response {
    counter!(SYNC_UPGRADE_REFUSALS_TOTAL, "reason" => error).increment(1);
    (status, Json(json!({ "error": error, "message": message }))).into_response()
}

/// GET /ws
///
/// The credential is checked before the upgrade: a refused device never
/// gets a socket.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_draining() {
        return refuse(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting-down",
            "server is shutting down".into(),
        );
    }
    let live = state.hub.registry().connection_count();
    if live >= state.config.max_connections {
        warn!(live, max = state.config.max_connections, "connection limit reached");
        return refuse(
            StatusCode::SERVICE_UNAVAILABLE,
            "capacity",
            "connection limit reached".into(),
        );
    }

    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(params.token);
    let principal = match state.hub.authenticate(credential.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": e.reason(), "message": e.to_string() })),
            )
                .into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let options = SessionOptions::from(state.config.as_ref());
    let shutdown = state.shutdown.token();
    let device = params.device;
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, principal, device, hub, options, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use pulse_auth::{AuthHandshake, StaticVerifier};
    use pulse_core::SystemClock;
    use pulse_goals::{InMemoryGoalStore, MilestonePolicy};
    use tower::ServiceExt;

    fn make_hub() -> Arc<SyncHub> {
        let verifier = StaticVerifier::new().with_token("tok-alice", "alice");
        Arc::new(SyncHub::new(
            AuthHandshake::new(Arc::new(verifier)),
            Arc::new(InMemoryGoalStore::new()),
            MilestonePolicy::default(),
            Arc::new(SystemClock),
            Duration::from_secs(1),
        ))
    }

    fn make_server() -> SyncServer {
        SyncServer::new(ServerConfig::default(), make_hub())
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server().router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["users"], 0);
    }

    #[tokio::test]
    async fn ws_without_credential_is_401() {
        let app = make_server().router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["error"], "missing");
    }

    #[tokio::test]
    async fn ws_with_bad_bearer_is_401() {
        let app = make_server().router();
        let req = Request::builder()
            .uri("/ws")
            .header(header::AUTHORIZATION, "Bearer forged")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "invalid");
    }

    #[tokio::test]
    async fn ws_with_good_token_but_no_upgrade_is_not_401() {
        let app = make_server().router();
        let req = Request::builder()
            .uri("/ws?token=tok-alice&device=web")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn ws_at_capacity_is_503() {
        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        let app = SyncServer::new(config, make_hub()).router();
        let req = Request::builder()
            .uri("/ws?token=tok-alice")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["error"], "capacity");
    }

    #[tokio::test]
    async fn ws_while_shutting_down_is_503() {
        let server = make_server();
        server.shutdown().begin_drain();
        let req = Request::builder()
            .uri("/ws?token=tok-alice")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn refusals_have_their_own_counter() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let resp = metrics::with_local_recorder(&recorder, || {
            refuse(
                StatusCode::SERVICE_UNAVAILABLE,
                "capacity",
                "connection limit reached".into(),
            )
        });
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let output = handle.render();
        assert!(
            output.contains(r#"sync_upgrade_refusals_total{reason="capacity"} 1"#),
            "{output}"
        );
        assert!(!output.contains("sync_handshake_rejections_total"), "{output}");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let app = make_server().router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = make_server().with_metrics(handle).router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server().router();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server
            .shutdown_gracefully(vec![handle], Some(Duration::from_secs(5)))
            .await;
        assert!(server.shutdown().is_draining());
    }
}

//! `HubServer`: axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{HealthResponse, health_check};
use crate::hub::sweeper::spawn_sweeper;
use crate::hub::{ConnectionManager, Metadata};
use crate::protocol::ProducerCatalog;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{SessionContext, run_ws_session};

/// Failure to start the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct AppState {
    manager: Arc<ConnectionManager>,
    catalog: Arc<ProducerCatalog>,
    config: Arc<ServerConfig>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

/// The pub-sub hub server.
pub struct HubServer {
    config: Arc<ServerConfig>,
    manager: Arc<ConnectionManager>,
    catalog: Arc<ProducerCatalog>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl HubServer {
    /// Create a server serving the topics in `catalog`.
    pub fn new(config: ServerConfig, catalog: ProducerCatalog) -> Self {
        let manager = Arc::new(ConnectionManager::new(config.max_connections));
        Self::with_manager(config, catalog, manager)
    }

    /// Create a server around an existing manager (used when a producer in
    /// `catalog` needs the same manager).
    pub fn with_manager(
        config: ServerConfig,
        catalog: ProducerCatalog,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            manager,
            catalog: Arc::new(catalog),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Expose `handle` on `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            catalog: Arc::clone(&self.catalog),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/topics", get(topics_handler))
            .route("/ws/{topic}", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, start the heartbeat sweeper and serve until shutdown.
    ///
    /// Returns the bound address and the serve task. On shutdown every
    /// connection is closed before the task completes.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let bind_addr = self.config.bind_addr();
        let bind_err = |source| ServerError::Bind {
            addr: bind_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&bind_addr).await.map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;
        let token = self.shutdown.token();

        let sweeper = spawn_sweeper(
            Arc::clone(&self.manager),
            self.config.sweep_interval(),
            self.config.heartbeat_timeout(),
            token.clone(),
        );

        let router = self.router();
        let manager = Arc::clone(&self.manager);
        let handle = tokio::spawn(async move {
            let stop = async move {
                token.cancelled().await;
                manager.shutdown();
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stop)
                .await
            {
                warn!(error = %e, "server error");
            }
            let _ = sweeper.await;
            info!("server stopped");
        });

        info!(%addr, topics = ?self.catalog.topics(), "hub listening");
        Ok((addr, handle))
    }

    /// Shared connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registered producers.
    pub fn catalog(&self) -> &ProducerCatalog {
        &self.catalog
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(
        state.start_time,
        state.manager.connection_count(),
        state.manager.topic_count(),
        state.manager.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /topics: producer topics and live subscriber counts.
async fn topics_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let subscribed: serde_json::Map<String, serde_json::Value> = state
        .manager
        .topic_summary()
        .into_iter()
        .map(|(topic, count)| (topic, count.into()))
        .collect();
    Json(serde_json::json!({
        "producers": state.catalog.topics(),
        "subscribers": subscribed,
    }))
}

/// GET /ws/{topic}: upgrade and run a protocol handler for `topic`.
async fn ws_handler(
    Path(topic): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(producer) = state.catalog.get(&topic) else {
        return (StatusCode::NOT_FOUND, format!("unknown topic: {topic}")).into_response();
    };
    if state.manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let mut metadata = Metadata::new();
    let _ = metadata.insert("topic".into(), topic.clone().into());
    if let Some(agent) = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        let _ = metadata.insert("user_agent".into(), agent.into());
    }

    let ctx = SessionContext {
        manager: Arc::clone(&state.manager),
        options: state.config.handler_options(),
        queue_capacity: state.config.send_queue_capacity,
        ping_interval: state.config.ws_ping_interval(),
    };
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, topic, producer, ctx, metadata))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::producer_fn;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> HubServer {
        let catalog =
            ProducerCatalog::new().with("wait_events", producer_fn(|| async { Ok(None) }));
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        HubServer::new(config, catalog)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let server = make_server();
        let (status, json) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
        assert_eq!(json["topics"], 0);
    }

    #[tokio::test]
    async fn topics_endpoint_lists_producers() {
        let server = make_server();
        let (status, json) = get_json(server.router(), "/topics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["producers"], serde_json::json!(["wait_events"]));
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let resp = server
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_handle_renders_text() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let server = make_server().with_metrics(recorder.handle());
        let resp = server
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let resp = server
            .router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_reports_bind_failure() {
        let first = make_server();
        let (addr, handle) = first.listen().await.unwrap();
        let taken = ServerConfig {
            port: addr.port(),
            ..ServerConfig::default()
        };
        let err = HubServer::new(taken, ProducerCatalog::new())
            .listen()
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&addr.port().to_string()));
        first.shutdown().graceful_shutdown(vec![handle], None).await;
    }

    #[test]
    fn accessors() {
        let server = make_server();
        assert_eq!(server.config().port, 0);
        assert!(server.catalog().contains("wait_events"));
        assert!(!server.shutdown().is_shutting_down());
        assert_eq!(server.manager().connection_count(), 0);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server
            .shutdown()
            .graceful_shutdown(vec![handle], Some(std::time::Duration::from_secs(5)))
            .await;
        assert!(server.manager().is_shutting_down());
    }
}

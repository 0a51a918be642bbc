//! HTTP API server: ingestion, queries, pipeline trigger and SSE streaming

use crate::api::state::AppState;
use crate::error::TraceryError;
use crate::gate::FEATURE_STREAMING;
use crate::pipeline::{summarize, RunReport};
use crate::storage::{EventStore, PatternOrder, PatternQuery, PatternStore, SortDirection};
use crate::stream::{ChannelKind, ConnectionStream, StreamMessage};
use crate::types::NewEvent;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::StreamExt as _;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// Interval between periodic pipeline triggers
    pub pipeline_interval: Duration,
    /// Interval between keepalive pings on dashboard streams
    pub ping_interval: Duration,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 8600).into(),
            pipeline_interval: Duration::from_secs(300),
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// API server owning the periodic pipeline trigger task
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
    trigger_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state,
            shutdown_tx,
            trigger_handle: None,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router (exposed for integration tests)
    pub fn build_router(state: AppState, ping_interval: Duration) -> Router {
        let routed = RoutedState {
            app: state,
            ping_interval,
        };

        Router::new()
            // Ingestion and queries
            .route("/events/log", post(log_event_handler))
            .route("/events/recent", get(recent_events_handler))
            // Learning surface
            .route("/learning/patterns", get(patterns_handler))
            .route("/learning/summary", get(summary_handler))
            .route("/learning/modules", get(modules_handler))
            .route("/learning/derive", post(derive_handler))
            // Streaming
            .route("/stream/events", get(dashboard_stream_handler))
            .route("/stream/chat", get(chat_stream_handler))
            // Health check
            .route("/health", get(health_handler))
            .with_state(routed)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start serving; runs until the process exits
    pub async fn serve(mut self) -> anyhow::Result<()> {
        let router = Self::build_router(self.state.clone(), self.config.ping_interval);

        // Periodic pipeline trigger with shutdown support
        let runner = self.state.runner.clone();
        let interval = self.config.pipeline_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let trigger_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match runner.trigger(None).await {
                            Ok(report) => debug!(
                                outcome = ?report.outcome,
                                written = report.patterns_written,
                                "periodic pipeline trigger"
                            ),
                            Err(e) => error!(error = %e, "periodic pipeline trigger failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("pipeline trigger task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.trigger_handle = Some(trigger_handle);

        let listener = tokio::net::TcpListener::bind(self.config.addr).await?;
        info!("API server listening on http://{}", self.config.addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.trigger_handle.take() {
            handle.abort();
            debug!("ApiServer dropped - pipeline trigger task aborted");
        }
    }
}

#[derive(Clone)]
struct RoutedState {
    app: AppState,
    ping_interval: Duration,
}

/// Error wrapper mapping the crate taxonomy onto HTTP statuses with an
/// `ok:false` structured body
struct ApiError(TraceryError);

impl From<TraceryError> for ApiError {
    fn from(err: TraceryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TraceryError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TraceryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }

        let body = Json(json!({"ok": false, "error": self.0.to_string()}));
        (status, body).into_response()
    }
}

/// POST /events/log
async fn log_event_handler(
    State(state): State<RoutedState>,
    Json(event): Json<NewEvent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let receipt = state.app.storage.append(&event).await?;
    Ok(Json(json!({
        "ok": true,
        "id": receipt.id,
        "created_at": receipt.created_at.to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_limit")]
    limit: usize,
    #[serde(default)]
    event_type: Option<String>,
}

fn default_recent_limit() -> usize {
    25
}

/// GET /events/recent
async fn recent_events_handler(
    State(state): State<RoutedState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let items = state
        .app
        .storage
        .recent(params.limit, params.event_type.as_deref())
        .await?;

    Ok(Json(json!({
        "ok": true,
        "count": items.len(),
        "items": items,
    })))
}

#[derive(Debug, Deserialize)]
struct PatternsParams {
    #[serde(default = "default_patterns_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_order")]
    order: PatternOrder,
    #[serde(default = "default_direction")]
    direction: SortDirection,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    pattern_type: Option<String>,
    #[serde(default)]
    min_confidence: f64,
}

fn default_patterns_limit() -> usize {
    50
}

fn default_order() -> PatternOrder {
    PatternOrder::Confidence
}

fn default_direction() -> SortDirection {
    SortDirection::Desc
}

/// GET /learning/patterns
///
/// Read-only surfacing of derived patterns; always permitted regardless of
/// Gate state.
async fn patterns_handler(
    State(state): State<RoutedState>,
    Query(params): Query<PatternsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state
        .app
        .storage
        .query_patterns(&PatternQuery {
            limit: params.limit,
            offset: params.offset,
            order: params.order,
            direction: params.direction,
            subject: params.subject,
            pattern_type: params.pattern_type,
            min_confidence: params.min_confidence,
        })
        .await?;

    Ok(Json(json!({
        "ok": true,
        "total": page.total,
        "items": page.items,
    })))
}

#[derive(Debug, Deserialize)]
struct SummaryParams {
    #[serde(default = "default_summary_limit")]
    limit: usize,
}

fn default_summary_limit() -> usize {
    200
}

/// GET /learning/summary
async fn summary_handler(
    State(state): State<RoutedState>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state.app.storage.recent(params.limit, None).await?;
    let summary = summarize(&events);

    Ok(Json(json!({
        "ok": true,
        "summary": summary,
    })))
}

/// GET /learning/modules
async fn modules_handler(State(state): State<RoutedState>) -> Json<serde_json::Value> {
    let descriptors = state.app.registry.descriptors();
    Json(json!({
        "ok": true,
        "items": descriptors,
    }))
}

#[derive(Debug, Deserialize)]
struct DeriveParams {
    #[serde(default)]
    subject: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeriveResponse {
    ok: bool,
    #[serde(flatten)]
    report: RunReport,
}

/// POST /learning/derive
///
/// Triggers one pipeline batch; a trigger arriving while a run is in
/// flight coalesces.
async fn derive_handler(
    State(state): State<RoutedState>,
    Query(params): Query<DeriveParams>,
) -> Result<Json<DeriveResponse>, ApiError> {
    let subjects: Option<Vec<String>> = params.subject.map(|s| vec![s]);
    let report = state.app.runner.trigger(subjects.as_deref()).await?;

    Ok(Json(DeriveResponse { ok: true, report }))
}

fn sse_frame(msg: &StreamMessage) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default().data(msg.to_data()))
}

/// A single terminal error frame for streams refused by the Gate
fn refused_stream(message: &str) -> Response {
    let frames = vec![sse_frame(&StreamMessage::error(message))];
    Sse::new(tokio_stream::iter(frames)).into_response()
}

/// GET /stream/events
///
/// Dashboard SSE: refresh ticks broadcast by the pipeline plus periodic
/// keepalive pings, all through the connection's FIFO queue.
async fn dashboard_stream_handler(State(state): State<RoutedState>) -> Response {
    if !state.app.gate.is_enabled(FEATURE_STREAMING) {
        return refused_stream("streaming is disabled");
    }

    let (sub, rx) = state
        .app
        .broker
        .subscribe(ChannelKind::Dashboard, None)
        .await;

    // Keepalive pings ride the same queue; the task stops as soon as the
    // connection is gone.
    let broker = state.app.broker.clone();
    let ping_interval = state.ping_interval;
    let id = sub.id;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(ping_interval).await;
            if !broker.send_to(id, StreamMessage::ping()).await {
                break;
            }
        }
    });

    let stream =
        ConnectionStream::new(sub.id, rx, state.app.broker.clone()).map(|msg| sse_frame(&msg));

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct ChatParams {
    q: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// GET /stream/chat
///
/// Streams completion deltas as `token` frames, then a terminal `done` (or
/// `error`) frame. Client disconnects propagate back to the provider as a
/// cooperative stop signal.
async fn chat_stream_handler(
    State(state): State<RoutedState>,
    Query(params): Query<ChatParams>,
) -> Response {
    if params.q.trim().is_empty() {
        return ApiError(TraceryError::Validation("q must not be empty".to_string()))
            .into_response();
    }

    if !state.app.gate.is_enabled(FEATURE_STREAMING) {
        return refused_stream("streaming is disabled");
    }

    let (sub, rx) = state
        .app
        .broker
        .subscribe(ChannelKind::Chat, params.session_id.clone())
        .await;

    // Post-hoc event logging; chat delivery never waits on the store.
    {
        let storage = state.app.storage.clone();
        let mut event = NewEvent::new("chat");
        event.source = "stream".to_string();
        event.session_id = params.session_id.clone();
        event.payload = json!({"q": params.q.clone()});
        tokio::spawn(async move {
            if let Err(e) = storage.append(&event).await {
                warn!(error = %e, "failed to log chat event");
            }
        });
    }

    // Pump: provider tokens -> connection queue -> SSE.
    let broker = state.app.broker.clone();
    let provider = state.app.provider.clone();
    let prompt = params.q.clone();
    let id = sub.id;
    tokio::spawn(async move {
        let (token_tx, mut token_rx) = tokio::sync::mpsc::channel::<String>(32);

        let generator = tokio::spawn(async move {
            provider.stream_completion(&prompt, token_tx).await
        });

        while let Some(token) = token_rx.recv().await {
            if !broker.send_to(id, StreamMessage::token(token)).await {
                // Client gone: dropping the receiver tells the provider to
                // stop generating.
                return;
            }
        }

        match generator.await {
            Ok(Ok(())) => {
                broker.send_to(id, StreamMessage::Done).await;
            }
            Ok(Err(e)) => {
                error!(error = %e, "completion provider failed");
                broker
                    .send_to(id, StreamMessage::error("completion failed"))
                    .await;
            }
            Err(e) => {
                error!(error = %e, "completion task panicked");
                broker
                    .send_to(id, StreamMessage::error("completion failed"))
                    .await;
            }
        }

        // Terminal frame sent; close the connection so the client observes
        // end-of-stream after the queued frames flush.
        broker.disconnect(id).await;
    });

    let stream =
        ConnectionStream::new(sub.id, rx, state.app.broker.clone()).map(|msg| sse_frame(&msg));

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// GET /health
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    subscribers: usize,
}

async fn health_handler(State(state): State<RoutedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        subscribers: state.app.broker.total_subscribers().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceryConfig;
    use crate::services::FallbackProvider;
    use crate::storage::LibsqlStorage;
    use std::sync::Arc;

    async fn test_state() -> AppState {
        let storage = Arc::new(LibsqlStorage::in_memory().await.unwrap());
        AppState::assemble(
            storage,
            &TraceryConfig::default(),
            Arc::new(FallbackProvider::instant()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_health_handler() {
        let state = RoutedState {
            app: test_state().await,
            ping_interval: Duration::from_secs(5),
        };

        let response = health_handler(State(state)).await;
        assert_eq!(response.0.status, "ok");
        assert_eq!(response.0.subscribers, 0);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let state = test_state().await;
        let _router = ApiServer::build_router(state, Duration::from_secs(5));
    }
}

//! HTTP gateway: chat, catalog, health, session inspection and moderation events

use crate::api::ApiError;
use crate::maintenance::spawn_maintenance;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chatrelay_core::{AppConfig, SessionId};
use chatrelay_router::{BackendSummary, ChatRequest};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/personas", get(personas_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(list_sessions_handler))
        .route(
            "/sessions/:id",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/moderation/events", get(moderation_events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn start_gateway(config: AppConfig) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind.to_addr(), config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    let state = Arc::new(AppState::from_config(config)?);
    let orchestrator = state.orchestrator.clone();

    let cancel = CancellationToken::new();
    let tasks = spawn_maintenance(orchestrator.clone(), &state.config, cancel.clone());

    info!("Chatrelay Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  Personas:     {}", orchestrator.personas().len());
    info!("  Backends:     {}", orchestrator.backends().list(None).len());
    info!("  Slots:        {}", orchestrator.slots().slot_count());
    if let Some(dir) = &state.config.sessions.persist_dir {
        info!("  Sessions:     {}", dir.display());
    }
    if let Some(path) = state.config.moderation_log_path() {
        info!("  Moderation:   {}", path.display());
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    match orchestrator.sessions().flush().await {
        Ok(n) if n > 0 => info!("Flushed {} sessions", n),
        Ok(_) => {}
        Err(e) => warn!("Final session flush failed: {}", e),
    }
    orchestrator.slots().unload_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    let result = state.orchestrator.handle(request).await?;
    Ok(Json(result))
}

/// Always 200: falls back to the degraded catalog.
async fn personas_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.catalog())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let orch = &state.orchestrator;
    let backends: Vec<BackendSummary> = orch
        .backends()
        .list(None)
        .iter()
        .map(BackendSummary::from)
        .collect();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": orch.sessions().len(),
        "personas": orch.personas().len(),
        "slots": orch.slots().status(),
        "backends": backends,
        "usage": orch.usage().snapshot(),
    }))
}

async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.sessions().list().await)
}

async fn get_session_handler(
    AxumPath(id): AxumPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let id = SessionId::parse(&id)?;
    match state.orchestrator.sessions().get(&id).await {
        Some(session) => Ok(Json(session)),
        None => Err(chatrelay_core::Error::SessionNotFound(id.to_string()).into()),
    }
}

async fn delete_session_handler(
    AxumPath(id): AxumPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    let id = SessionId::parse(&id)?;
    if state.orchestrator.sessions().delete(&id) {
        info!(session = %id, "Session deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(chatrelay_core::Error::SessionNotFound(id.to_string()).into())
    }
}

const MAX_EVENTS: usize = 1000;

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
}

fn default_event_limit() -> usize {
    100
}

/// Most recent moderation decisions, oldest first. Empty when no log is configured.
async fn moderation_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let events = match state.orchestrator.moderation_log() {
        Some(log) => log.recent(query.limit.min(MAX_EVENTS))?,
        None => Vec::new(),
    };
    Ok(Json(events))
}

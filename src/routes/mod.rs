use axum::{
    extract::State,
    middleware::{self as axum_middleware},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::context::SyncContext;
use crate::error::ApiError;
use crate::messaging::{Envelope, MessageBus};
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// State shared by the bridge handlers
#[derive(Clone)]
pub struct AppState {
    pub context: Arc<SyncContext>,
    pub bus: Arc<MessageBus>,
    /// Key UI surfaces must present; `None` leaves the bridge open
    pub bridge_api_key: Option<String>,
}

/// Health check routes (no authentication required)
pub fn health_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Message and event routes (require the bridge key when one is set)
pub fn bridge_routes(state: AppState) -> Router {
    Router::new()
        .route("/message", post(message_handler))
        .route("/events", get(events_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Full bridge application with middleware
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(health_routes(state.clone()))
        .merge(bridge_routes(state))
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "clipsync is running",
        "version": VERSION
    }))
}

/// GET /health - Connectivity, session and queue state
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let context = &state.context;
    let pending = match context.queue.len().await {
        Ok(count) => json!(count),
        Err(e) => {
            tracing::warn!("Could not read pending queue: {:#}", e);
            Value::Null
        }
    };

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION,
        "online": context.network.is_online(),
        "authenticated": context.auth.is_authenticated().await,
        "pendingCount": pending,
        "syncRunning": context.scheduler.is_running(),
    }))
}

/// POST /message - One `{name, body}` request, one reply
async fn message_handler(
    State(state): State<AppState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Value>, ApiError> {
    tracing::debug!(message = %envelope.name, "Bridge message");
    let reply = state.bus.call(envelope).await?;
    Ok(Json(reply))
}

/// GET /events - Storage changes and sync confirmations as server-sent events
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let storage = receiver_stream(state.context.storage.subscribe())
        .map(|change| Event::default().event("storage").json_data(change));
    let sync = receiver_stream(state.context.reconciler.subscribe())
        .map(|event| Event::default().event("sync").json_data(event));

    Sse::new(stream::select(storage, sync)).keep_alive(KeepAlive::default())
}

/// Broadcast receiver as a stream; lagging subscribers skip ahead
fn receiver_stream<T>(rx: broadcast::Receiver<T>) -> impl Stream<Item = T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

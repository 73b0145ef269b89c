//! HTTP transport over the sync service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/sync/start` | Start the loop (if idle) and stream notifications (SSE) |
//! | `GET`  | `/sync/stop` | Stop the loop and stream the final notification (SSE) |
//! | `GET`  | `/sync/status` | Checkpoint snapshot and next scheduled pass |
//! | `GET`  | `/sync/status/stream` | Flag changes as they happen (SSE) |
//! | `GET`  | `/sync/is_sync_in_progress` | `{"is_sync_in_progress": bool}` |
//! | `GET`  | `/sync/is_fetch_in_progress` | `{"is_fetch_in_progress": bool}` |
//! | `GET`  | `/sync/fetch_interval` | `{"fetch_interval": secs}` |
//! | `PUT`  | `/sync/fetch_interval` | Body `{"fetch_interval": secs}` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! SSE events are named after the notification (`onProgress`, `onDone`,
//! `onStop`) and carry its JSON form as data. Status-stream events are
//! named `status`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "already_in_progress", "message": "sync is already in progress" } }
//! ```
//!
//! Error codes: `already_in_progress` (409), `invalid_interval` (400),
//! `bad_request` (400), `uninitialized` (503), and `upstream_error`,
//! `sink_error`, `store_error` or `cancelled` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::controller::ControllerStatus;
use crate::error::SyncError;
use crate::service::{SyncAction, SyncService};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    service: Arc<SyncService>,
    /// Ends long-lived status streams on shutdown.
    shutdown: CancellationToken,
}

/// Build the router. Exposed separately from [`serve`] for embedding.
pub fn router(service: Arc<SyncService>, shutdown: CancellationToken) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sync/start", get(handle_start))
        .route("/sync/stop", get(handle_stop))
        .route("/sync/status", get(handle_status))
        .route("/sync/status/stream", get(handle_status_stream))
        .route("/sync/is_sync_in_progress", get(handle_is_sync))
        .route("/sync/is_fetch_in_progress", get(handle_is_fetch))
        .route(
            "/sync/fetch_interval",
            get(handle_get_interval).put(handle_put_interval),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { service, shutdown })
}

/// Serve on an already-bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    service: Arc<SyncService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "sync server listening");
    }
    let app = router(service, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::AlreadyInProgress(_) => StatusCode::CONFLICT,
            SyncError::InvalidInterval(_) => StatusCode::BAD_REQUEST,
            SyncError::StoreUninitialized(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /sync/start, /sync/stop ============

async fn handle_start(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    subscribe_sse(&state, SyncAction::Start).await
}

async fn handle_stop(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    subscribe_sse(&state, SyncAction::Stop).await
}

async fn subscribe_sse(
    state: &AppState,
    action: SyncAction,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let subscription = state.service.subscribe(action).await?;
    let stream = subscription
        .into_stream()
        .map(|n| Event::default().event(n.event_name()).json_data(&n));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ /sync/status ============

async fn handle_status(State(state): State<AppState>) -> Result<Json<ControllerStatus>, AppError> {
    Ok(Json(state.service.controller().status().await?))
}

/// Sends the current flags immediately, then one event per change.
async fn handle_status_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.controller().status_changes();
    let stream = futures::stream::unfold(
        (rx, state.shutdown.clone(), true),
        |(mut rx, shutdown, first)| async move {
            if !first {
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    changed = rx.changed() => changed.ok()?,
                }
            }
            let status = *rx.borrow_and_update();
            let event = Event::default()
                .event("status")
                .json_data(status)
                .unwrap_or_else(|_| Event::default().event("status"));
            Some((Ok(event), (rx, shutdown, false)))
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Serialize)]
struct IsSyncResponse {
    is_sync_in_progress: bool,
}

async fn handle_is_sync(State(state): State<AppState>) -> Result<Json<IsSyncResponse>, AppError> {
    Ok(Json(IsSyncResponse {
        is_sync_in_progress: state.service.controller().get_is_sync_in_progress().await?,
    }))
}

#[derive(Serialize)]
struct IsFetchResponse {
    is_fetch_in_progress: bool,
}

async fn handle_is_fetch(
    State(state): State<AppState>,
) -> Result<Json<IsFetchResponse>, AppError> {
    Ok(Json(IsFetchResponse {
        is_fetch_in_progress: state.service.controller().get_is_fetch_in_progress().await?,
    }))
}

// ============ /sync/fetch_interval ============

#[derive(Serialize)]
struct IntervalResponse {
    fetch_interval: u64,
}

#[derive(Deserialize)]
struct IntervalRequest {
    fetch_interval: i64,
}

async fn handle_get_interval(
    State(state): State<AppState>,
) -> Result<Json<IntervalResponse>, AppError> {
    Ok(Json(IntervalResponse {
        fetch_interval: state.service.controller().get_fetch_interval().await?,
    }))
}

async fn handle_put_interval(
    State(state): State<AppState>,
    body: Result<Json<IntervalRequest>, JsonRejection>,
) -> Result<Json<IntervalResponse>, AppError> {
    let Json(body) = body.map_err(|e| bad_request(e.body_text()))?;
    let fetch_interval = state
        .service
        .controller()
        .update_fetch_interval(body.fetch_interval)
        .await?;
    Ok(Json(IntervalResponse { fetch_interval }))
}

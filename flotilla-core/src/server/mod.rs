//! HTTP/JSON binding of the runner-facing commands
//!
//! The command surface is transport-agnostic; this module binds it over
//! axum for remote runners: register/unregister/heartbeat, a snapshot
//! read of the assignment map, a server-streamed notification channel
//! (SSE), and the Prometheus metrics route.

pub mod types;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;

use crate::error::{ErrorKind, FlotillaError};
use crate::manager::{ManagerHandle, RunnerAddress};
use crate::metrics::gather_manager_metrics;

use types::{Ack, AddressParams, AssignmentEntry, AssignmentsResponse, ErrorBody, RegisterRequest};

/// Build the manager's HTTP router
pub fn router(handle: ManagerHandle) -> Router {
    Router::new()
        .route("/v1/register", post(register))
        .route("/v1/unregister", post(unregister))
        .route("/v1/heartbeat", post(heartbeat))
        .route("/v1/assignments", get(assignments))
        .route("/v1/notifications", get(notifications))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

/// `FlotillaError` mapped onto an HTTP status by its kind
struct ApiError(FlotillaError);

impl From<FlotillaError> for ApiError {
    fn from(e: FlotillaError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match self.0.kind() {
            ErrorKind::ClientMisuse => match self.0 {
                FlotillaError::RunnerNotRegistered { .. } => {
                    (StatusCode::NOT_FOUND, "client_misuse")
                }
                _ => (StatusCode::BAD_REQUEST, "client_misuse"),
            },
            ErrorKind::Transient => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
            ErrorKind::Persistence => (StatusCode::SERVICE_UNAVAILABLE, "persistence"),
            ErrorKind::Invariant => (StatusCode::INTERNAL_SERVER_ERROR, "invariant"),
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

async fn register(
    State(handle): State<ManagerHandle>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Ack>, ApiError> {
    handle
        .register(RunnerAddress::new(req.host, req.port), req.version)
        .await?;
    Ok(Json(Ack { ok: true }))
}

async fn unregister(
    State(handle): State<ManagerHandle>,
    Json(req): Json<AddressParams>,
) -> Result<Json<Ack>, ApiError> {
    handle
        .unregister(RunnerAddress::new(req.host, req.port))
        .await?;
    Ok(Json(Ack { ok: true }))
}

async fn heartbeat(
    State(handle): State<ManagerHandle>,
    Json(req): Json<AddressParams>,
) -> Result<Json<Ack>, ApiError> {
    handle
        .heartbeat(RunnerAddress::new(req.host, req.port))
        .await?;
    Ok(Json(Ack { ok: true }))
}

async fn assignments(State(handle): State<ManagerHandle>) -> Json<AssignmentsResponse> {
    let entries = handle
        .get_assignments()
        .into_iter()
        .map(|(shard, owner)| AssignmentEntry {
            shard,
            owner: owner.map(|a| a.to_string()),
        })
        .collect();
    Json(AssignmentsResponse {
        version: handle.commit_version(),
        assignments: entries,
    })
}

/// Server-streamed assignment deltas for one runner
///
/// Opens with a snapshot of the runner's current shards; each commit
/// that touches the runner appends a delta event.
async fn notifications(
    State(handle): State<ManagerHandle>,
    Query(params): Query<AddressParams>,
) -> Result<impl IntoResponse, ApiError> {
    let rx = handle
        .subscribe(RunnerAddress::new(params.host, params.port))
        .await?;
    let stream =
        ReceiverStream::new(rx).map(|n| SseEvent::default().event("assignment").json_data(&n));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn metrics() -> String {
    gather_manager_metrics()
}

//! handlers.rs: HTTP surface of the artifact path
//!
//! ## Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/api/fleet/artifacts/{id}/{sha2}` | GET | Fetch a decoded artifact body |
//! | `/healthz` | GET | Liveness probe |
//!
//! The artifact endpoint authenticates the caller's bearer credential,
//! loads its agent record, and hands the request to the fetcher. The
//! response body is the decoded artifact (`application/octet-stream`);
//! every failure maps onto the error taxonomy:
//!
//! | Error | Status |
//! |---|---|
//! | `BadSha2` | 400 |
//! | `Unauthorized` | 401 |
//! | `Forbidden` | 403 |
//! | `RecordMismatch`, store not-found | 404 |
//! | `Throttled` | 429 |
//! | `IntegrityFail`, fatal store failure | 500 |
//! | transient store failure | 503 |

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info_span, Instrument};

use fleet_common::error::FleetError;
use fleet_common::store::{Credentials, DocStore, StoreError};

use crate::artifact::ArtifactFetcher;
use crate::auth::auth_agent;

// ════════════════════════════════════════════════════════════════════════════
// APP STATE
// ════════════════════════════════════════════════════════════════════════════

/// Shared state behind the artifact routes.
pub struct AppState {
    pub fetcher: ArtifactFetcher,
    pub store: Arc<dyn DocStore>,
    pub credentials: Arc<dyn Credentials>,
    pub agents_index: String,
}

/// Build the ingress router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/fleet/artifacts/:id/:sha2", get(handle_artifact))
        .route("/healthz", get(handle_healthz))
        .with_state(state)
}

// ════════════════════════════════════════════════════════════════════════════
// RESPONSES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    status: u16,
    error: String,
}

/// Map a fleet error onto its boundary status code.
pub fn http_status(err: &FleetError) -> StatusCode {
    match err {
        FleetError::BadSha2 => StatusCode::BAD_REQUEST,
        FleetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        FleetError::Forbidden(_) => StatusCode::FORBIDDEN,
        // opaque to clients: the record exists but cannot be trusted
        FleetError::RecordMismatch { .. } => StatusCode::NOT_FOUND,
        FleetError::Throttled => StatusCode::TOO_MANY_REQUESTS,
        FleetError::IntegrityFail { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        FleetError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
        FleetError::Store(err) if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &FleetError) -> Response {
    let status = http_status(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "artifact request failed server-side");
    }
    (
        status,
        Json(ErrorResponse {
            status: status.as_u16(),
            error: err.to_string(),
        }),
    )
        .into_response()
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

async fn handle_artifact(
    State(state): State<Arc<AppState>>,
    Path((id, sha2)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let span = info_span!("artifact_get", identifier = %id, sha2 = %sha2);
    async move {
        let agent = match auth_agent(
            &headers,
            None,
            &state.store,
            &state.credentials,
            &state.agents_index,
        )
        .await
        {
            Ok(agent) => agent,
            Err(err) => return error_response(&err),
        };

        match state.fetcher.fetch(&agent, &id, &sha2).await {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                body,
            )
                .into_response(),
            Err(err) => error_response(&err),
        }
    }
    .instrument(span)
    .await
}

async fn handle_healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

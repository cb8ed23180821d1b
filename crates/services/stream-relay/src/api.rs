//! HTTP lookup endpoint
//!
//! - `GET /view/*identifier` - Resolve an identifier to a relay port
//!
//! The body is always `{"port": <int>}`, with `-1` when no relay could be
//! provided; failures additionally carry an `error` kind. Everything after
//! `/view/` is the identifier, so an empty or slash-containing identifier
//! still gets a JSON answer.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::RelayErrorKind;
use crate::session::SessionCache;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SessionCache>,
}

impl AppState {
    pub fn new(cache: Arc<SessionCache>) -> Self {
        Self { cache }
    }
}

/// Response body for a lookup
#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub port: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RelayErrorKind>,
}

/// Build the HTTP router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/view/", get(view_empty))
        .route("/view/*identifier", get(view))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve an identifier to a relay port
///
/// GET /view/*identifier
async fn view(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Json<ViewResponse> {
    lookup(&state, &identifier).await
}

/// GET /view/
async fn view_empty(State(state): State<AppState>) -> Json<ViewResponse> {
    lookup(&state, "").await
}

async fn lookup(state: &AppState, identifier: &str) -> Json<ViewResponse> {
    let result = state.cache.resolve(identifier).await;
    Json(ViewResponse {
        port: result.port,
        error: result.error,
    })
}

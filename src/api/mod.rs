pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::error::EtlError;
use crate::stats::Stats;
use crate::store::Database;

/// Read-only view shared by every handler. The pipeline owns all writes.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub sources: Vec<String>,
    pub stats: Arc<Stats>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/data", get(routes::data))
        .route("/health", get(routes::health))
        .route("/stats", get(routes::stats))
        .route("/coins/:symbol", get(routes::coin))
        .route("/raw/:id", get(routes::raw_record))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Invalid(String),
    NotFound(String),
    Storage(EtlError),
}

impl From<EtlError> for ApiError {
    fn from(e: EtlError) -> Self {
        ApiError::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Invalid(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Storage(e) => {
                tracing::error!(error = %e, "storage error while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

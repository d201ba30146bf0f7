//! HTTP surface for the audit trail.

pub mod audit;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::AuditTrail;
use crate::error::AuditError;

#[derive(Clone)]
pub struct AppState {
    pub trail: Arc<AuditTrail>,
}

impl AppState {
    pub fn new(trail: Arc<AuditTrail>) -> Self {
        Self { trail }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/audit/entries",
            post(audit::create_entry).get(audit::list_entries),
        )
        .route("/audit/report", get(audit::report))
        .route("/audit/verify", get(audit::verify))
        .route("/audit/reconcile", post(audit::reconcile))
        .route("/audit/incidents", get(audit::list_incidents))
        .route(
            "/audit/incidents/:id/acknowledge",
            post(audit::acknowledge_incident),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "fiscal-audit",
        "timestamp": chrono::Utc::now()
    }))
}

/// Maps [`AuditError`] onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub AuditError);

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AuditError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuditError::WriteConflict { .. } | AuditError::IntegrityViolation { .. } => {
                StatusCode::CONFLICT
            }
            AuditError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuditError::NotFound(_) => StatusCode::NOT_FOUND,
            AuditError::Store(_)
            | AuditError::Fallback(_)
            | AuditError::Config(_)
            | AuditError::Interrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

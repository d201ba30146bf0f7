use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState};
use crate::audit::entry::{Actor, AuditLogEntry, LogRequest};
use crate::audit::report::AuditReport;
use crate::audit::trail::{LogOutcome, ReconcileReport};
use crate::audit::verify::{SequenceRange, VerificationReport};
use crate::database::{Incident, Page, SearchCriteria};

pub async fn create_entry(
    State(state): State<AppState>,
    Json(request): Json<LogRequest>,
) -> Result<(StatusCode, Json<LogOutcome>), ApiError> {
    let outcome = state.trail.log(request).await?;
    let status = if outcome.is_degraded() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

pub async fn list_entries(
    State(state): State<AppState>,
    Query(criteria): Query<SearchCriteria>,
) -> Result<Json<Page<AuditLogEntry>>, ApiError> {
    Ok(Json(state.trail.search(&criteria).await?))
}

pub async fn report(
    State(state): State<AppState>,
    Query(criteria): Query<SearchCriteria>,
) -> Result<Json<AuditReport>, ApiError> {
    Ok(Json(state.trail.generate_report(criteria).await?))
}

/// Always 200: a broken chain is a result, not a request failure.
pub async fn verify(
    State(state): State<AppState>,
    Query(range): Query<SequenceRange>,
) -> Result<Json<VerificationReport>, ApiError> {
    let range = (!range.is_unbounded()).then_some(range);
    Ok(Json(state.trail.verify_integrity(range).await?))
}

pub async fn reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>, ApiError> {
    Ok(Json(state.trail.reconcile_fallback().await?))
}

pub async fn list_incidents(
    State(state): State<AppState>,
) -> Result<Json<Vec<Incident>>, ApiError> {
    Ok(Json(state.trail.pending_incidents().await?))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub actor: Actor,
    pub note: String,
}

pub async fn acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<Json<Incident>, ApiError> {
    info!(incident = id, by = %body.actor.user_id, "Acknowledging integrity incident");
    let incident = state
        .trail
        .acknowledge_incident(id, body.actor, &body.note)
        .await?;
    Ok(Json(incident))
}

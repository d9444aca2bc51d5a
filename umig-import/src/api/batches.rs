//! Batch history and administration handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Actor;
use crate::error::ApiResult;
use crate::models::{
    AuditEntry, BatchFilter, BatchStatistics, BatchStatus, ImportBatch, ImportKind, ImportStatistics,
    RollbackResult,
};
use crate::services::{CancelOutcome, OrchestratorSnapshot, ProgressReport};
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub actor: Option<String>,
    pub status: Option<BatchStatus>,
    pub kind: Option<ImportKind>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: BatchStatus,
    pub statistics: Option<BatchStatistics>,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub batch_id: Uuid,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    #[serde(default)]
    pub after_seq: u64,
}

/// GET /api/import/history
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<ImportBatch>>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let filter = BatchFilter {
        actor: query.actor,
        status: query.status,
        kind: query.kind,
    };
    Ok(Json(state.service.history(&filter, limit).await?))
}

/// GET /api/import/statistics
pub async fn statistics(State(state): State<AppState>) -> ApiResult<Json<ImportStatistics>> {
    Ok(Json(state.service.statistics().await?))
}

/// GET /api/import/orchestrator
pub async fn orchestrator_status(State(state): State<AppState>) -> Json<OrchestratorSnapshot> {
    Json(state.service.orchestrator_status().await)
}

/// GET /api/import/batches/:id
pub async fn get_batch(State(state): State<AppState>, Path(batch_id): Path<Uuid>) -> ApiResult<Json<ImportBatch>> {
    Ok(Json(state.service.batch(batch_id).await?))
}

/// DELETE /api/import/batches/:id
///
/// Only rolled back batches can be deleted.
pub async fn delete_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Actor(actor): Actor,
) -> ApiResult<StatusCode> {
    state.service.delete_batch(batch_id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/import/batches/:id/status
pub async fn update_status(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Actor(actor): Actor,
    Json(request): Json<StatusUpdateRequest>,
) -> ApiResult<Json<ImportBatch>> {
    let batch = state
        .service
        .update_status(batch_id, request.status, request.statistics, &actor, request.reason.as_deref())
        .await?;
    Ok(Json(batch))
}

/// POST /api/import/batches/:id/rollback
///
/// Body is optional.
pub async fn rollback(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Actor(actor): Actor,
    request: Option<Json<RollbackRequest>>,
) -> ApiResult<Json<RollbackResult>> {
    let reason = request.and_then(|Json(r)| r.reason);
    let result = state.service.rollback(batch_id, reason.as_deref(), &actor).await?;
    Ok(Json(result))
}

/// POST /api/import/batches/:id/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Actor(actor): Actor,
) -> ApiResult<Json<CancelResponse>> {
    let outcome = state.service.cancel(batch_id, &actor).await?;
    Ok(Json(CancelResponse { batch_id, outcome }))
}

/// GET /api/import/batches/:id/audit
pub async fn audit_trail(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.service.audit_trail(batch_id).await?))
}

/// GET /api/import/batches/:id/progress?after_seq=N
pub async fn progress(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Json<ProgressReport>> {
    Ok(Json(state.service.progress(batch_id, query.after_seq).await?))
}

/// Build batch query and administration routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/api/import/history", get(history))
        .route("/api/import/statistics", get(statistics))
        .route("/api/import/orchestrator", get(orchestrator_status))
        .route("/api/import/batches/:id", get(get_batch).delete(delete_batch))
        .route("/api/import/batches/:id/status", put(update_status))
        .route("/api/import/batches/:id/rollback", post(rollback))
        .route("/api/import/batches/:id/cancel", post(cancel))
        .route("/api/import/batches/:id/audit", get(audit_trail))
        .route("/api/import/batches/:id/progress", get(progress))
}

//! Import submission handlers
//!
//! POST /api/import/json, /api/import/json/batch, /api/import/master-plan,
//! /api/import/csv/:entity
//!
//! Handlers wait for the batch to finish and return its response; a queued
//! submission therefore answers once it has been admitted and run.

use axum::{
    extract::{Path, Query, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use super::Actor;
use crate::error::{ApiError, ApiResult};
use crate::models::{BatchImportResponse, CsvImportResponse, EntityType, ImportResponse};
use crate::services::SubmitOptions;
use crate::AppState;

/// Body of single-document JSON imports
#[derive(Debug, Deserialize)]
pub struct JsonImportRequest {
    /// File or logical name recorded on the batch
    pub source: String,
    /// Document as a JSON string or inline JSON
    pub content: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    pub max_failure_ratio: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct JsonFile {
    pub filename: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct JsonBatchImportRequest {
    pub files: Vec<JsonFile>,
    #[serde(default)]
    pub priority: i32,
    pub max_failure_ratio: Option<f64>,
}

/// Query of CSV imports (the body is the CSV text itself)
#[derive(Debug, Default, Deserialize)]
pub struct CsvImportQuery {
    pub source: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub max_failure_ratio: Option<f64>,
}

/// Inline JSON is imported as its serialized text
fn content_text(content: serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

/// POST /api/import/json
pub async fn import_json(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<JsonImportRequest>,
) -> ApiResult<Json<ImportResponse>> {
    let options = SubmitOptions {
        priority: request.priority,
        max_failure_ratio: request.max_failure_ratio,
    };
    let response = state
        .service
        .import_json(&request.source, content_text(request.content), &actor, options)
        .await?;
    Ok(Json(response))
}

/// POST /api/import/json/batch
pub async fn import_json_batch(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<JsonBatchImportRequest>,
) -> ApiResult<Json<BatchImportResponse>> {
    let options = SubmitOptions {
        priority: request.priority,
        max_failure_ratio: request.max_failure_ratio,
    };
    let files = request
        .files
        .into_iter()
        .map(|file| (file.filename, content_text(file.content)))
        .collect();
    let response = state.service.import_json_batch(files, &actor, options).await?;
    Ok(Json(response))
}

/// POST /api/import/master-plan
pub async fn import_master_plan(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<JsonImportRequest>,
) -> ApiResult<Json<ImportResponse>> {
    let options = SubmitOptions {
        priority: request.priority,
        max_failure_ratio: request.max_failure_ratio,
    };
    let response = state
        .service
        .import_master_plan(&request.source, content_text(request.content), &actor, options)
        .await?;
    Ok(Json(response))
}

/// POST /api/import/csv/:entity
///
/// `all` takes a JSON object mapping entity names to CSV text.
pub async fn import_csv(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(query): Query<CsvImportQuery>,
    Actor(actor): Actor,
    body: String,
) -> ApiResult<Json<CsvImportResponse>> {
    let options = SubmitOptions {
        priority: query.priority,
        max_failure_ratio: query.max_failure_ratio,
    };

    if entity.eq_ignore_ascii_case("all") {
        let raw: HashMap<String, String> = serde_json::from_str(&body)
            .map_err(|e| ApiError::BadRequest(format!("expected a JSON object of entity -> CSV text: {}", e)))?;
        let mut files = BTreeMap::new();
        for (name, csv) in raw {
            let entity: EntityType = name.parse().map_err(ApiError::BadRequest)?;
            files.insert(entity, csv);
        }
        let response = state.service.import_csv_all(files, &actor, options).await?;
        return Ok(Json(response));
    }

    let entity: EntityType = entity.parse().map_err(ApiError::BadRequest)?;
    let source = query
        .source
        .unwrap_or_else(|| format!("{}.csv", entity.plural()));
    let response = state
        .service
        .import_csv(entity, &source, body, &actor, options)
        .await?;
    Ok(Json(response))
}

/// Build import submission routes
pub fn import_routes() -> Router<AppState> {
    Router::new()
        .route("/api/import/json", post(import_json))
        .route("/api/import/json/batch", post(import_json_batch))
        .route("/api/import/master-plan", post(import_master_plan))
        .route("/api/import/csv/:entity", post(import_csv))
}

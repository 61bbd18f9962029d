// GET handlers: version, aggregates, stats, tasks

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{AppState, NAME, VERSION};
use crate::error::RollupError;
use crate::models::StatValue;

const DEFAULT_AGGREGATES_LIMIT: u32 = 100;
const MAX_AGGREGATES_LIMIT: u32 = 10_000;

/// Collaborator failure surfaced as a 500 with a JSON message.
pub(super) struct ApiError(RollupError);

impl From<RollupError> for ApiError {
    fn from(e: RollupError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "inspection request failed");
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// GET /version: returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct AggregatesParams {
    key: Option<String>,
    limit: Option<u32>,
}

/// GET /api/resources/{id}/aggregates: newest records first, optionally for one key.
pub(super) async fn aggregates_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AggregatesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_AGGREGATES_LIMIT)
        .clamp(1, MAX_AGGREGATES_LIMIT);
    let records = state
        .store
        .aggregates(&id, params.key.as_deref(), limit)
        .await?;
    Ok(Json(records))
}

/// GET /api/resources/{id}/stats: in-memory stats keyed by rollup key.
pub(super) async fn stats_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats: BTreeMap<String, StatValue> = state
        .cache
        .stats(&id)
        .await?
        .into_iter()
        .map(|(key, stat)| (key.to_string(), stat))
        .collect();
    Ok(Json(stats))
}

/// GET /api/tasks: journaled tasks that have not reached a terminal stage.
pub(super) async fn tasks_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = match &state.journal {
        Some(journal) => journal.list().await?,
        None => Vec::new(),
    };
    Ok(Json(tasks))
}

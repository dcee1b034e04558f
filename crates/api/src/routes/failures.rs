use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tripdesk_core::types::AutomationFailure;

use crate::{
    error::{ApiResult, AppError, ResultExt},
    state::{AppState, RequestId},
};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/automation-failures", get(list_failures))
        .route("/v1/automation-failures/{id}/resolve", post(resolve_failure))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FailureList {
    items: Vec<AutomationFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    id: String,
    resolved_at: DateTime<Utc>,
}

async fn list_failures(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<FailureList>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let items = state
        .failures
        .list_unresolved(limit)
        .await
        .or_api(&request_id)?;
    Ok(Json(FailureList { items }))
}

async fn resolve_failure(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> ApiResult<Json<ResolveResponse>> {
    let now = Utc::now();
    if state.failures.resolve(&id, now).await.or_api(&request_id)? {
        return Ok(Json(ResolveResponse {
            id,
            resolved_at: now,
        }));
    }

    let err = match state.failures.get_failure(&id).await.or_api(&request_id)? {
        Some(_) => AppError::Conflict(format!("failure {id} is already resolved")),
        None => AppError::NotFound(format!("failure {id} not found")),
    };
    Err(err.with_request_id(&request_id.0))
}

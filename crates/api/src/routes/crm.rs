use axum::{extract::State, http::StatusCode, routing::post, Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tripdesk_core::crm::AutomationRequest;

use crate::{
    error::{ApiResult, ResultExt},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/crm/automations", post(dispatch))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchBody {
    #[serde(flatten)]
    request: AutomationRequest,
    #[serde(default, alias = "best_effort")]
    best_effort: bool,
}

/// Runs the automation inline, or queues it when `bestEffort` is set.
async fn dispatch(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<DispatchBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.best_effort {
        let queued = state.automations.enqueue(body.request);
        return Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))));
    }

    let outcome = state
        .dispatcher
        .dispatch(body.request)
        .await
        .or_api(&request_id)?;
    Ok((StatusCode::OK, Json(json!(outcome))))
}

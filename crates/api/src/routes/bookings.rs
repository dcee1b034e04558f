use axum::{
    extract::{Path, State},
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tripdesk_core::lifecycle::{TransitionRequest, TransitionResult};
use tripdesk_core::types::{ActorType, LifecycleStatus, TransitionRecord};

use crate::{
    error::{ApiResult, ResultExt},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/bookings/{id}/transitions",
            post(create_transition).get(list_transitions),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitionBody {
    #[serde(alias = "to_status", alias = "to")]
    to_status: LifecycleStatus,
    #[serde(default, alias = "idempotency_key")]
    idempotency_key: String,
    note: Option<String>,
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct TransitionList {
    items: Vec<TransitionRecord>,
}

/// Manual transition by an operator.
async fn create_transition(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(booking_id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> ApiResult<Json<TransitionResult>> {
    let mut request = TransitionRequest::new(
        booking_id,
        body.to_status,
        ActorType::Human,
        body.idempotency_key,
    );
    if let Some(note) = body.note {
        request = request.with_note(note);
    }
    if let Some(metadata) = body.metadata {
        request = request.with_metadata(metadata);
    }

    let result = state.lifecycle.transition(request).await.or_api(&request_id)?;
    Ok(Json(result))
}

async fn list_transitions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(booking_id): Path<String>,
) -> ApiResult<Json<TransitionList>> {
    let items = state
        .bookings
        .list_transitions(&booking_id)
        .await
        .or_api(&request_id)?;
    Ok(Json(TransitionList { items }))
}

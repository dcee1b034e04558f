use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use tripdesk_core::crm::AutomationRequest;
use tripdesk_core::payments::CreateIntent;
use tripdesk_core::types::{AutomationEvent, Payment, PaymentProvider};

use crate::{
    error::{ApiResult, ResultExt},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/bookings/{id}/payment-intents", post(create_intent))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIntentBody {
    provider: PaymentProvider,
    amount: Option<f64>,
    currency: Option<String>,
    #[serde(alias = "idempotency_key")]
    idempotency_key: Option<String>,
    #[serde(alias = "customer_id")]
    customer_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateIntentResponse {
    payment: Payment,
    provider_payload: Value,
    reused: bool,
}

async fn create_intent(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(booking_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateIntentBody>,
) -> ApiResult<(StatusCode, Json<CreateIntentResponse>)> {
    let header_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut request = CreateIntent::new(booking_id, body.provider);
    request.amount = body.amount;
    request.currency = body.currency;
    request.idempotency_key = body.idempotency_key.or(header_key);
    request.customer_id = body.customer_id;

    let created = state.payments.create_intent(request).await.or_api(&request_id)?;

    if !created.reused {
        let payment = &created.payment;
        let queued = state.automations.enqueue(
            AutomationRequest::for_booking(AutomationEvent::PaymentLinkCreated, &payment.booking_id)
                .with_payload(json!({
                    "amount": payment.amount,
                    "currency": payment.currency,
                    "payment_id": payment.id,
                    "provider": payment.provider,
                })),
        );
        info!(
            event = "payment_intent_created",
            payment_id = %payment.id,
            booking_id = %payment.booking_id,
            automation_queued = queued
        );
    }

    let status = if created.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(CreateIntentResponse {
            payment: created.payment,
            provider_payload: created.provider_payload,
            reused: created.reused,
        }),
    ))
}

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Extension, Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tripdesk_core::crm::AutomationRequest;
use tripdesk_core::payments::WebhookDelivery;
use tripdesk_core::types::{AutomationEvent, PaymentProvider, PaymentStatus, UnknownVariant};

use crate::{
    error::{ApiResult, AppError, ResultExt},
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/webhooks/{provider}", post(receive))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    received: bool,
    duplicate: bool,
    payment_id: String,
    status: PaymentStatus,
    lifecycle_changed: bool,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Gateway callback. The body is kept raw so the signature covers the exact
/// bytes the gateway sent.
async fn receive(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let provider: PaymentProvider = provider
        .parse()
        .map_err(|err: UnknownVariant| AppError::NotFound(err.to_string()).with_request_id(&request_id.0))?;

    let signature = match provider {
        PaymentProvider::Razorpay => header(&headers, "x-razorpay-signature"),
        PaymentProvider::Stripe => header(&headers, "stripe-signature"),
        PaymentProvider::Manual => None,
    };
    let event_id_hint =
        header(&headers, "x-razorpay-event-id").or_else(|| header(&headers, "x-event-id"));

    let outcome = state
        .payments
        .handle_webhook(WebhookDelivery {
            provider,
            raw_body: body.to_vec(),
            signature,
            event_id_hint,
        })
        .await
        .or_api(&request_id)?;

    let payment = &outcome.payment;
    if outcome.lifecycle_changed && payment.status == PaymentStatus::Captured {
        state.automations.enqueue(
            AutomationRequest::for_booking(AutomationEvent::BookingWon, &payment.booking_id)
                .with_payload(json!({
                    "payment_id": payment.id,
                    "amount": payment.amount,
                    "currency": payment.currency,
                })),
        );
    }

    Ok(Json(WebhookAck {
        received: true,
        duplicate: outcome.duplicate,
        payment_id: outcome.payment.id.clone(),
        status: outcome.payment.status,
        lifecycle_changed: outcome.lifecycle_changed,
    }))
}

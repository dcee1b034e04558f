use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::status::{advances, lifecycle_target, map_event_status};
use super::{PaymentService, WebhookDelivery, WebhookOutcome};
use crate::error::PaymentError;
use crate::signature::{verify_razorpay, verify_stripe};
use crate::store::WebhookWrite;
use crate::types::{from_minor_units, new_id, Payment, PaymentProvider, PaymentStatus, WebhookEventRecord};

/// Normalised gateway webhook body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    #[serde(alias = "event_id")]
    id: Option<String>,
    #[serde(alias = "type", alias = "event_type")]
    event: Option<String>,
    #[serde(alias = "booking_id")]
    booking_id: Option<String>,
    #[serde(alias = "order_id")]
    order_id: Option<String>,
    #[serde(alias = "payment_intent_id")]
    payment_intent_id: Option<String>,
    amount: Option<f64>,
    #[serde(alias = "amount_captured")]
    amount_captured: Option<i64>,
    #[serde(alias = "amount_refunded")]
    amount_refunded: Option<i64>,
    currency: Option<String>,
}

impl PaymentService {
    pub async fn handle_webhook(
        &self,
        delivery: WebhookDelivery,
    ) -> Result<WebhookOutcome, PaymentError> {
        self.verify(&delivery)?;

        let payload: WebhookPayload = serde_json::from_slice(&delivery.raw_body)
            .map_err(|err| PaymentError::InvalidPayload(err.to_string()))?;
        let event_id = payload
            .id
            .clone()
            .or(delivery.event_id_hint.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| PaymentError::InvalidPayload("missing event id".to_string()))?;
        let mapped = map_event_status(payload.event.as_deref().unwrap_or_default());

        if let Some(seen) = self.payments.find_webhook_event(&event_id).await? {
            let payment = self
                .payments
                .get_payment(&seen.payment_id)
                .await?
                .ok_or_else(|| {
                    PaymentError::InvalidPayload(format!(
                        "event {event_id} references unknown payment"
                    ))
                })?;
            return self.redeliver(payment, &event_id, seen.status).await;
        }

        let now = Utc::now();
        let mut payment = match self.resolve_payment(&delivery, &payload).await? {
            Some(existing) => existing,
            None => self.unknown_payment(&delivery, &payload, &event_id).await?,
        };

        let advancing = advances(payment.status, mapped);
        if advancing {
            payment.status = mapped;
        } else {
            warn!(
                payment_id = %payment.id,
                current = %payment.status,
                incoming = %mapped,
                event_id = %event_id,
                "webhook status would regress payment, keeping current status"
            );
        }
        if let Some(captured) = payload.amount_captured {
            payment.amount_captured = captured;
        }
        if let Some(refunded) = payload.amount_refunded {
            payment.amount_refunded = refunded;
        }
        if advancing && mapped == PaymentStatus::Captured && payment.paid_at.is_none() {
            payment.paid_at = Some(now);
        }
        payment.webhook_event_id = Some(event_id.clone());
        payment.updated_at = now;

        let record = WebhookEventRecord {
            event_id: event_id.clone(),
            provider: delivery.provider,
            payment_id: payment.id.clone(),
            status: mapped,
            received_at: now,
        };
        let payment = match self.payments.record_webhook(&payment, &record).await? {
            WebhookWrite::Recorded(payment) => payment,
            WebhookWrite::AlreadyRecorded(stored) => {
                return self.redeliver(stored, &event_id, mapped).await;
            }
        };
        // a concurrent event may have carried the stored row past `mapped`
        let applied = advancing && payment.status == mapped;
        if advancing && !applied {
            warn!(
                payment_id = %payment.id,
                stored = %payment.status,
                incoming = %mapped,
                event_id = %event_id,
                "concurrent webhook already advanced payment, keeping stored status"
            );
        }
        info!(
            event = "payment_webhook_recorded",
            event_id = %event_id,
            payment_id = %payment.id,
            booking_id = %payment.booking_id,
            status = %payment.status,
            "payment webhook recorded"
        );

        let mut lifecycle_changed = false;
        if applied {
            if let Some(target) = lifecycle_target(mapped) {
                let result = self
                    .advance_lifecycle(
                        &payment,
                        target,
                        format!("webhook:{event_id}"),
                        settlement_metadata(&payment, &event_id),
                    )
                    .await?;
                lifecycle_changed = result.changed();
            }
        }

        Ok(WebhookOutcome {
            payment,
            lifecycle_changed,
            duplicate: false,
        })
    }

    fn verify(&self, delivery: &WebhookDelivery) -> Result<(), PaymentError> {
        let signature = delivery
            .signature
            .as_deref()
            .ok_or(PaymentError::SignatureInvalid)?;
        let verified = match delivery.provider {
            PaymentProvider::Razorpay => self
                .secrets
                .razorpay
                .as_deref()
                .is_some_and(|secret| verify_razorpay(secret, &delivery.raw_body, signature)),
            PaymentProvider::Stripe => self.secrets.stripe.as_deref().is_some_and(|secret| {
                verify_stripe(secret, &delivery.raw_body, signature, Utc::now().timestamp())
            }),
            PaymentProvider::Manual => false,
        };
        if verified {
            Ok(())
        } else {
            warn!(provider = %delivery.provider, "webhook signature rejected");
            Err(PaymentError::SignatureInvalid)
        }
    }

    /// A redelivered event: the stored payment is returned untouched and the
    /// transition it should have caused is requested again under the same key.
    async fn redeliver(
        &self,
        payment: Payment,
        event_id: &str,
        recorded: PaymentStatus,
    ) -> Result<WebhookOutcome, PaymentError> {
        info!(event_id = %event_id, payment_id = %payment.id, "duplicate payment webhook");
        let mut lifecycle_changed = false;
        if payment.status == recorded {
            if let Some(target) = lifecycle_target(recorded) {
                let result = self
                    .advance_lifecycle(
                        &payment,
                        target,
                        format!("webhook:{event_id}"),
                        settlement_metadata(&payment, event_id),
                    )
                    .await?;
                lifecycle_changed = result.changed();
            }
        }
        Ok(WebhookOutcome {
            payment,
            lifecycle_changed,
            duplicate: true,
        })
    }

    async fn resolve_payment(
        &self,
        delivery: &WebhookDelivery,
        payload: &WebhookPayload,
    ) -> Result<Option<Payment>, PaymentError> {
        let order_id = payload.order_id.as_deref();
        let intent_id = payload.payment_intent_id.as_deref();
        if order_id.is_some() || intent_id.is_some() {
            if let Some(payment) = self
                .payments
                .find_by_provider_ref(delivery.provider, order_id, intent_id)
                .await?
            {
                return Ok(Some(payment));
            }
        }
        match &payload.booking_id {
            Some(booking_id) => Ok(self
                .payments
                .latest_for_booking(booking_id, delivery.provider)
                .await?),
            None => Ok(None),
        }
    }

    async fn unknown_payment(
        &self,
        delivery: &WebhookDelivery,
        payload: &WebhookPayload,
        event_id: &str,
    ) -> Result<Payment, PaymentError> {
        let booking_id = payload.booking_id.clone().ok_or_else(|| {
            PaymentError::InvalidPayload("webhook names neither a known payment nor a booking".into())
        })?;
        let booking = self
            .bookings
            .get_booking(&booking_id)
            .await?
            .ok_or(PaymentError::BookingNotFound(booking_id))?;

        let currency = payload
            .currency
            .as_deref()
            .map(str::to_ascii_uppercase)
            .unwrap_or(booking.currency);
        let amount = payload
            .amount
            .or_else(|| {
                payload
                    .amount_captured
                    .map(|minor| from_minor_units(minor, &currency))
            })
            .unwrap_or(booking.due_amount);
        let now = Utc::now();
        Ok(Payment {
            id: new_id("pay"),
            booking_id: booking.id,
            provider: delivery.provider,
            idempotency_key: format!("webhook:{event_id}"),
            provider_order_id: payload.order_id.clone(),
            provider_payment_intent_id: payload.payment_intent_id.clone(),
            webhook_event_id: None,
            status: PaymentStatus::RequiresAction,
            amount,
            amount_captured: 0,
            amount_refunded: 0,
            currency,
            paid_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

fn settlement_metadata(payment: &Payment, event_id: &str) -> Value {
    let mut metadata = json!({
        "payment_id": payment.id,
        "event_id": event_id,
    });
    match payment.status {
        PaymentStatus::Captured => {
            let paid = if payment.amount_captured > 0 {
                from_minor_units(payment.amount_captured, &payment.currency)
            } else {
                payment.amount
            };
            metadata["amount_paid"] = json!(paid);
        }
        PaymentStatus::Refunded => {
            metadata["amount_refunded"] = json!(from_minor_units(payment.amount_refunded, &payment.currency));
        }
        _ => {}
    }
    metadata
}

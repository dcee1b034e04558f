use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use super::{CreateIntent, IntentCreated, PaymentService};
use crate::error::PaymentError;
use crate::lifecycle::TransitionRequest;
use crate::types::{
    new_id, to_minor_units, ActorType, Booking, LifecycleStatus, Payment, PaymentProvider,
    PaymentStatus,
};

impl PaymentService {
    pub async fn create_intent(&self, request: CreateIntent) -> Result<IntentCreated, PaymentError> {
        let booking = self
            .bookings
            .get_booking(&request.booking_id)
            .await?
            .ok_or_else(|| PaymentError::BookingNotFound(request.booking_id.clone()))?;

        let amount = request.amount.unwrap_or(booking.due_amount);
        if !amount.is_finite() || amount <= 0.0 {
            return Err(PaymentError::InvalidAmount(amount));
        }
        let currency = request
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(booking.currency.as_str())
            .to_ascii_uppercase();
        let idempotency_key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("intent_{}", nanoid::nanoid!()));

        if let Some(existing) = self.payments.find_by_idempotency_key(&idempotency_key).await? {
            return self.reuse(existing, &booking, request.customer_id).await;
        }

        let now = Utc::now();
        let (provider_order_id, provider_payment_intent_id) = match request.provider {
            PaymentProvider::Razorpay => (Some(new_id("order")), None),
            PaymentProvider::Stripe => (None, Some(new_id("pi"))),
            PaymentProvider::Manual => (None, None),
        };
        let payment = Payment {
            id: new_id("pay"),
            booking_id: booking.id.clone(),
            provider: request.provider,
            idempotency_key,
            provider_order_id,
            provider_payment_intent_id,
            webhook_event_id: None,
            status: PaymentStatus::RequiresAction,
            amount,
            amount_captured: 0,
            amount_refunded: 0,
            currency,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };

        match self.payments.insert_payment(&payment).await {
            Ok(()) => {}
            Err(err) if err.is_unique_violation() => {
                let existing = self
                    .payments
                    .find_by_idempotency_key(&payment.idempotency_key)
                    .await?
                    .ok_or(PaymentError::Persistence(err))?;
                return self.reuse(existing, &booking, request.customer_id).await;
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            event = "payment_intent_created",
            payment_id = %payment.id,
            booking_id = %booking.id,
            provider = %payment.provider,
            amount = payment.amount,
            currency = %payment.currency,
            "payment intent created"
        );
        self.mark_pending(&booking, &payment).await?;

        Ok(IntentCreated {
            provider_payload: provider_payload(&payment, request.customer_id.as_deref()),
            payment,
            reused: false,
        })
    }

    async fn reuse(
        &self,
        payment: Payment,
        booking: &Booking,
        customer_id: Option<String>,
    ) -> Result<IntentCreated, PaymentError> {
        // the lifecycle key is derived from the payment id, so repeating it is safe
        self.mark_pending(booking, &payment).await?;
        Ok(IntentCreated {
            provider_payload: provider_payload(&payment, customer_id.as_deref()),
            payment,
            reused: true,
        })
    }

    async fn mark_pending(&self, booking: &Booking, payment: &Payment) -> Result<(), PaymentError> {
        if booking.lifecycle_status != LifecycleStatus::BookingCreated
            || payment.booking_id != booking.id
        {
            return Ok(());
        }
        let request = TransitionRequest::new(
            &booking.id,
            LifecycleStatus::PaymentPending,
            ActorType::System,
            format!("payment_intent:{}", payment.id),
        )
        .with_metadata(json!({ "payment_id": payment.id }));
        self.lifecycle.transition(request).await?;
        Ok(())
    }
}

/// Checkout metadata a client needs to open the gateway's payment sheet.
fn provider_payload(payment: &Payment, customer_id: Option<&str>) -> Value {
    let mut payload = json!({
        "provider": payment.provider,
        "paymentId": payment.id,
        "amount": to_minor_units(payment.amount, &payment.currency),
        "currency": payment.currency,
        "bookingId": payment.booking_id,
        "customerId": customer_id,
    });
    if let Some(order_id) = &payment.provider_order_id {
        payload["orderId"] = json!(order_id);
    }
    if let Some(intent_id) = &payment.provider_payment_intent_id {
        payload["paymentIntentId"] = json!(intent_id);
    }
    payload
}

//! Payment intents and gateway webhook ingestion.
//!
//! Payments are created against a booking with an idempotency key and then
//! driven by gateway webhooks, which are verified, deduplicated through the
//! processed-event ledger and turned into lifecycle transitions.

mod intent;
pub mod status;
mod webhook;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::error::{LifecycleError, PaymentError};
use crate::lifecycle::{LifecycleEngine, TransitionRequest, TransitionResult};
use crate::store::{BookingStore, FailureStore, PaymentStore};
use crate::types::{ActorType, LifecycleStatus, NewAutomationFailure, Payment, PaymentProvider};

pub use status::map_event_status;

#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub razorpay: Option<String>,
    pub stripe: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub booking_id: String,
    pub provider: PaymentProvider,
    /// Major units; defaults to the booking's due amount.
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub idempotency_key: Option<String>,
    pub customer_id: Option<String>,
}

impl CreateIntent {
    pub fn new(booking_id: impl Into<String>, provider: PaymentProvider) -> Self {
        Self {
            booking_id: booking_id.into(),
            provider,
            amount: None,
            currency: None,
            idempotency_key: None,
            customer_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentCreated {
    pub payment: Payment,
    pub provider_payload: Value,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub provider: PaymentProvider,
    pub raw_body: Vec<u8>,
    pub signature: Option<String>,
    /// Event id from a transport header, used when the body carries none.
    pub event_id_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookOutcome {
    pub payment: Payment,
    pub lifecycle_changed: bool,
    pub duplicate: bool,
}

#[derive(Clone)]
pub struct PaymentService {
    bookings: Arc<dyn BookingStore>,
    payments: Arc<dyn PaymentStore>,
    failures: Arc<dyn FailureStore>,
    lifecycle: LifecycleEngine,
    secrets: WebhookSecrets,
}

impl PaymentService {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        payments: Arc<dyn PaymentStore>,
        failures: Arc<dyn FailureStore>,
        lifecycle: LifecycleEngine,
    ) -> Self {
        Self {
            bookings,
            payments,
            failures,
            lifecycle,
            secrets: WebhookSecrets::default(),
        }
    }

    pub fn with_secrets(mut self, secrets: WebhookSecrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Runs a payment-driven lifecycle transition. Failures are recorded for
    /// operators before being returned.
    async fn advance_lifecycle(
        &self,
        payment: &Payment,
        to_status: LifecycleStatus,
        idempotency_key: String,
        metadata: Value,
    ) -> Result<TransitionResult, PaymentError> {
        let request = TransitionRequest::new(
            &payment.booking_id,
            to_status,
            ActorType::Webhook,
            idempotency_key.clone(),
        )
        .with_metadata(metadata);

        match self.lifecycle.transition(request).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.record_lifecycle_failure(payment, to_status, &idempotency_key, &err)
                    .await;
                Err(PaymentError::Lifecycle(err))
            }
        }
    }

    async fn record_lifecycle_failure(
        &self,
        payment: &Payment,
        to_status: LifecycleStatus,
        idempotency_key: &str,
        err: &LifecycleError,
    ) {
        error!(
            event = "payment_lifecycle_transition_failed",
            booking_id = %payment.booking_id,
            payment_id = %payment.id,
            to = %to_status,
            error = %err,
            "lifecycle transition failed after payment update"
        );
        let failure = NewAutomationFailure {
            booking_id: Some(payment.booking_id.clone()),
            event: idempotency_key.to_string(),
            error_message: err.to_string(),
            payload: json!({
                "payment_id": payment.id,
                "provider": payment.provider,
                "payment_status": payment.status,
                "to_status": to_status,
            }),
            meta: json!({ "channel": "lifecycle", "dedup_key": idempotency_key }),
        };
        if let Err(store_err) = self.failures.record_failure(failure).await {
            error!(error = %store_err, payment_id = %payment.id, "could not record lifecycle failure");
        }
    }
}

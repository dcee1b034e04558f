//! Row types and their conversion into domain types.
//!
//! Status columns are stored as text; a value that no longer parses is
//! reported as an invalid record rather than silently defaulted.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tripdesk_core::error::StoreError;
use tripdesk_core::types::{
    AutomationFailure, Booking, Lead, Payment, TransitionRecord, UnknownVariant,
    WebhookEventRecord,
};

fn parse<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|err: UnknownVariant| StoreError::InvalidRecord(err.to_string()))
}

#[derive(Debug, Clone, FromRow)]
pub struct BookingRow {
    pub id: String,
    pub lead_id: Option<String>,
    pub lifecycle_status: String,
    pub payment_status: String,
    pub gross_amount: f64,
    pub paid_amount: f64,
    pub due_amount: f64,
    pub refund_amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            lifecycle_status: parse(&row.lifecycle_status)?,
            payment_status: parse(&row.payment_status)?,
            id: row.id,
            lead_id: row.lead_id,
            gross_amount: row.gross_amount,
            paid_amount: row.paid_amount,
            due_amount: row.due_amount,
            refund_amount: row.refund_amount,
            currency: row.currency,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TransitionRow {
    pub id: String,
    pub booking_id: String,
    pub from_status: String,
    pub to_status: String,
    pub actor_type: String,
    pub idempotency_key: String,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for TransitionRecord {
    type Error = StoreError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(TransitionRecord {
            from_status: parse(&row.from_status)?,
            to_status: parse(&row.to_status)?,
            actor_type: parse(&row.actor_type)?,
            id: row.id,
            booking_id: row.booking_id,
            idempotency_key: row.idempotency_key,
            note: row.note,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentRow {
    pub id: String,
    pub booking_id: String,
    pub provider: String,
    pub idempotency_key: String,
    pub provider_order_id: Option<String>,
    pub provider_payment_intent_id: Option<String>,
    pub webhook_event_id: Option<String>,
    pub status: String,
    pub amount: f64,
    pub amount_captured: i64,
    pub amount_refunded: i64,
    pub currency: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            provider: parse(&row.provider)?,
            status: parse(&row.status)?,
            id: row.id,
            booking_id: row.booking_id,
            idempotency_key: row.idempotency_key,
            provider_order_id: row.provider_order_id,
            provider_payment_intent_id: row.provider_payment_intent_id,
            webhook_event_id: row.webhook_event_id,
            amount: row.amount,
            amount_captured: row.amount_captured,
            amount_refunded: row.amount_refunded,
            currency: row.currency,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookEventRow {
    pub event_id: String,
    pub provider: String,
    pub payment_id: String,
    pub status: String,
    pub received_at: DateTime<Utc>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = StoreError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            provider: parse(&row.provider)?,
            status: parse(&row.status)?,
            event_id: row.event_id,
            payment_id: row.payment_id,
            received_at: row.received_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LeadRow {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub stage: Option<String>,
}

impl From<LeadRow> for Lead {
    fn from(row: LeadRow) -> Self {
        Lead {
            id: row.id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            stage: row.stage,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FailureRow {
    pub id: String,
    pub booking_id: Option<String>,
    pub event: String,
    pub error_message: String,
    pub payload: serde_json::Value,
    pub meta: serde_json::Value,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<FailureRow> for AutomationFailure {
    fn from(row: FailureRow) -> Self {
        AutomationFailure {
            id: row.id,
            booking_id: row.booking_id,
            event: row.event,
            error_message: row.error_message,
            payload: row.payload,
            meta: row.meta,
            attempts: row.attempts,
            last_attempt_at: row.last_attempt_at,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripdesk_core::types::{LifecycleStatus, PaymentStatus};

    fn booking_row(status: &str) -> BookingRow {
        let now = Utc::now();
        BookingRow {
            id: "bk_1".into(),
            lead_id: None,
            lifecycle_status: status.into(),
            payment_status: "unpaid".into(),
            gross_amount: 10.0,
            paid_amount: 0.0,
            due_amount: 10.0,
            refund_amount: 0.0,
            currency: "INR".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_booking_row_converts() {
        let booking = Booking::try_from(booking_row("payment_pending")).unwrap();
        assert_eq!(booking.lifecycle_status, LifecycleStatus::PaymentPending);
    }

    #[test]
    fn test_unknown_status_is_invalid_record() {
        let err = Booking::try_from(booking_row("shipped")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[test]
    fn test_webhook_event_row_converts() {
        let record = WebhookEventRecord::try_from(WebhookEventRow {
            event_id: "evt_1".into(),
            provider: "stripe".into(),
            payment_id: "pay_1".into(),
            status: "captured".into(),
            received_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(record.status, PaymentStatus::Captured);
    }
}

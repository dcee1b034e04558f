//! Payment and webhook ledger queries.

use sqlx::PgPool;
use tripdesk_core::types::{Payment, PaymentStatus, WebhookEventRecord};

use crate::models::{PaymentRow, WebhookEventRow};

const PAYMENT_COLUMNS: &str = "id, booking_id, provider, idempotency_key, provider_order_id, \
     provider_payment_intent_id, webhook_event_id, status, amount, amount_captured, \
     amount_refunded, currency, paid_at, created_at, updated_at";

pub async fn get_by_id(pool: &PgPool, id: &str) -> Result<Option<PaymentRow>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_idempotency_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<PaymentRow>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = $1"
    ))
    .bind(key)
    .fetch_optional(pool)
    .await
}

/// Matches on either gateway correlation id; `NULL` arguments never match.
pub async fn get_by_provider_ref(
    pool: &PgPool,
    provider: &str,
    provider_order_id: Option<&str>,
    provider_payment_intent_id: Option<&str>,
) -> Result<Option<PaymentRow>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        r#"
        SELECT {PAYMENT_COLUMNS}
        FROM payments
        WHERE provider = $1
          AND (provider_order_id = $2 OR provider_payment_intent_id = $3)
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(provider)
    .bind(provider_order_id)
    .bind(provider_payment_intent_id)
    .fetch_optional(pool)
    .await
}

pub async fn latest_for_booking(
    pool: &PgPool,
    booking_id: &str,
    provider: &str,
) -> Result<Option<PaymentRow>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        r#"
        SELECT {PAYMENT_COLUMNS}
        FROM payments
        WHERE booking_id = $1 AND provider = $2
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(booking_id)
    .bind(provider)
    .fetch_optional(pool)
    .await
}

const INSERT_PAYMENT: &str = r#"
        INSERT INTO payments
            (id, booking_id, provider, idempotency_key, provider_order_id,
             provider_payment_intent_id, webhook_event_id, status, amount,
             amount_captured, amount_refunded, currency, paid_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#;

macro_rules! bind_payment {
    ($query:expr, $payment:expr) => {{
        let payment: &Payment = $payment;
        $query
            .bind(&payment.id)
            .bind(&payment.booking_id)
            .bind(payment.provider.as_str())
            .bind(&payment.idempotency_key)
            .bind(&payment.provider_order_id)
            .bind(&payment.provider_payment_intent_id)
            .bind(&payment.webhook_event_id)
            .bind(payment.status.as_str())
            .bind(payment.amount)
            .bind(payment.amount_captured)
            .bind(payment.amount_refunded)
            .bind(&payment.currency)
            .bind(payment.paid_at)
            .bind(payment.created_at)
            .bind(payment.updated_at)
    }};
}

/// Plain insert; a taken idempotency key surfaces as a unique violation.
pub async fn create(pool: &PgPool, payment: &Payment) -> Result<(), sqlx::Error> {
    write(pool, INSERT_PAYMENT.to_string(), payment).await
}

/// `CASE` expression ranking a payment status column.
fn status_rank(column: &str) -> String {
    let arms: String = PaymentStatus::ALL
        .iter()
        .map(|status| format!(" WHEN '{}' THEN {}", status.as_str(), status.rank()))
        .collect();
    format!("(CASE {column}{arms} END)")
}

/// Merges onto the committed row under the conflict lock, mirroring
/// `Payment::merge_webhook`, and returns the stored row.
async fn upsert<'e, E>(executor: E, payment: &Payment) -> Result<PaymentRow, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let sql = format!(
        r#"{INSERT_PAYMENT}
        ON CONFLICT (id) DO UPDATE
        SET webhook_event_id = EXCLUDED.webhook_event_id,
            status = CASE WHEN {incoming} >= {current}
                          THEN EXCLUDED.status ELSE payments.status END,
            amount_captured = GREATEST(payments.amount_captured, EXCLUDED.amount_captured),
            amount_refunded = GREATEST(payments.amount_refunded, EXCLUDED.amount_refunded),
            paid_at = COALESCE(payments.paid_at, EXCLUDED.paid_at),
            updated_at = EXCLUDED.updated_at
        RETURNING {PAYMENT_COLUMNS}
        "#,
        incoming = status_rank("EXCLUDED.status"),
        current = status_rank("payments.status"),
    );
    bind_payment!(sqlx::query_as::<_, PaymentRow>(&sql), payment)
        .fetch_one(executor)
        .await
}

async fn write<'e, E>(executor: E, sql: String, payment: &Payment) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    bind_payment!(sqlx::query(&sql), payment)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn get_webhook_event(
    pool: &PgPool,
    event_id: &str,
) -> Result<Option<WebhookEventRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookEventRow>(
        r#"
        SELECT event_id, provider, payment_id, status, received_at
        FROM payment_webhook_events
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
}

/// Upserts the payment and appends the event to the ledger in one
/// transaction, returning the stored payment. Returns `None` when the event
/// id was already recorded; the payment write is rolled back in that case.
pub async fn record_webhook(
    pool: &PgPool,
    payment: &Payment,
    event: &WebhookEventRecord,
) -> Result<Option<PaymentRow>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let stored = upsert(&mut *tx, payment).await?;

    let inserted: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO payment_webhook_events (event_id, provider, payment_id, status, received_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (event_id) DO NOTHING
        RETURNING event_id
        "#,
    )
    .bind(&event.event_id)
    .bind(event.provider.as_str())
    .bind(&event.payment_id)
    .bind(event.status.as_str())
    .bind(event.received_at)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        return Ok(None);
    }
    tx.commit().await?;
    Ok(Some(stored))
}

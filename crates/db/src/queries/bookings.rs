//! Booking and lifecycle transition queries.
//!
//! A transition commits the booking update and its transition record in one
//! transaction. The booking update is a compare-and-set on the status the
//! engine read, and the record insert is guarded by the unique idempotency
//! key, so concurrent writers cannot both commit.

use sqlx::{PgPool, Postgres, Transaction};
use tripdesk_core::store::{ApplyOutcome, BookingChange};

use crate::models::{BookingRow, TransitionRow};

const BOOKING_COLUMNS: &str = "id, lead_id, lifecycle_status, payment_status, gross_amount, \
     paid_amount, due_amount, refund_amount, currency, created_at, updated_at";

const TRANSITION_COLUMNS: &str = "id, booking_id, from_status, to_status, actor_type, \
     idempotency_key, note, metadata, created_at";

pub async fn get_by_id(pool: &PgPool, id: &str) -> Result<Option<BookingRow>, sqlx::Error> {
    sqlx::query_as::<_, BookingRow>(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn find_transition(
    pool: &PgPool,
    idempotency_key: &str,
) -> Result<Option<TransitionRow>, sqlx::Error> {
    sqlx::query_as::<_, TransitionRow>(&format!(
        "SELECT {TRANSITION_COLUMNS} FROM lifecycle_transitions WHERE idempotency_key = $1"
    ))
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
}

pub async fn list_transitions(
    pool: &PgPool,
    booking_id: &str,
) -> Result<Vec<TransitionRow>, sqlx::Error> {
    sqlx::query_as::<_, TransitionRow>(&format!(
        "SELECT {TRANSITION_COLUMNS} FROM lifecycle_transitions \
         WHERE booking_id = $1 ORDER BY created_at ASC"
    ))
    .bind(booking_id)
    .fetch_all(pool)
    .await
}

/// Applies a lifecycle change. Returns the committed booking row, or the
/// reason nothing was written.
pub async fn apply_transition(
    pool: &PgPool,
    change: &BookingChange,
) -> Result<Applied, sqlx::Error> {
    let mut tx = pool.begin().await?;

    if let Some(existing) = find_transition_in(&mut tx, &change.record.idempotency_key).await? {
        tx.rollback().await?;
        return Ok(Applied::KeyTaken(existing));
    }

    let booking = &change.booking;
    let updated = sqlx::query_as::<_, BookingRow>(&format!(
        r#"
        UPDATE bookings
        SET lifecycle_status = $2,
            payment_status = $3,
            paid_amount = $4,
            due_amount = $5,
            refund_amount = $6,
            updated_at = $7
        WHERE id = $1 AND lifecycle_status = $8
        RETURNING {BOOKING_COLUMNS}
        "#
    ))
    .bind(&booking.id)
    .bind(booking.lifecycle_status.as_str())
    .bind(booking.payment_status.as_str())
    .bind(booking.paid_amount)
    .bind(booking.due_amount)
    .bind(booking.refund_amount)
    .bind(booking.updated_at)
    .bind(change.expected_status.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(updated) = updated else {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM bookings WHERE id = $1)")
                .bind(&booking.id)
                .fetch_one(&mut *tx)
                .await?;
        tx.rollback().await?;
        return Ok(if exists {
            Applied::StatusMoved
        } else {
            Applied::BookingMissing
        });
    };

    let record = &change.record;
    let inserted: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO lifecycle_transitions
            (id, booking_id, from_status, to_status, actor_type, idempotency_key, note, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&record.id)
    .bind(&record.booking_id)
    .bind(record.from_status.as_str())
    .bind(record.to_status.as_str())
    .bind(record.actor_type.as_str())
    .bind(&record.idempotency_key)
    .bind(&record.note)
    .bind(&record.metadata)
    .bind(record.created_at)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        return match find_transition(pool, &record.idempotency_key).await? {
            Some(existing) => Ok(Applied::KeyTaken(existing)),
            None => Ok(Applied::StatusMoved),
        };
    }

    tx.commit().await?;
    Ok(Applied::Booking(updated))
}

async fn find_transition_in(
    tx: &mut Transaction<'_, Postgres>,
    idempotency_key: &str,
) -> Result<Option<TransitionRow>, sqlx::Error> {
    sqlx::query_as::<_, TransitionRow>(&format!(
        "SELECT {TRANSITION_COLUMNS} FROM lifecycle_transitions WHERE idempotency_key = $1"
    ))
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await
}

/// Row-level counterpart of [`ApplyOutcome`].
#[derive(Debug)]
pub enum Applied {
    Booking(BookingRow),
    KeyTaken(TransitionRow),
    StatusMoved,
    BookingMissing,
}

impl Applied {
    pub fn into_outcome(self) -> Result<ApplyOutcome, tripdesk_core::error::StoreError> {
        Ok(match self {
            Applied::Booking(row) => ApplyOutcome::Applied(row.try_into()?),
            Applied::KeyTaken(row) => ApplyOutcome::KeyTaken(row.try_into()?),
            Applied::StatusMoved => ApplyOutcome::StatusMoved,
            Applied::BookingMissing => ApplyOutcome::BookingMissing,
        })
    }
}

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tripdesk_core::types::NewAutomationFailure;

use crate::models::FailureRow;

const FAILURE_COLUMNS: &str = "id, booking_id, event, error_message, payload, meta, attempts, \
     last_attempt_at, resolved_at, created_at";

pub async fn create(
    pool: &PgPool,
    id: &str,
    failure: &NewAutomationFailure,
) -> Result<FailureRow, sqlx::Error> {
    sqlx::query_as::<_, FailureRow>(&format!(
        r#"
        INSERT INTO automation_failures (id, booking_id, event, error_message, payload, meta)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {FAILURE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(&failure.booking_id)
    .bind(&failure.event)
    .bind(&failure.error_message)
    .bind(&failure.payload)
    .bind(&failure.meta)
    .fetch_one(pool)
    .await
}

pub async fn get_by_id(pool: &PgPool, id: &str) -> Result<Option<FailureRow>, sqlx::Error> {
    sqlx::query_as::<_, FailureRow>(&format!(
        "SELECT {FAILURE_COLUMNS} FROM automation_failures WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list_unresolved(pool: &PgPool, limit: i64) -> Result<Vec<FailureRow>, sqlx::Error> {
    sqlx::query_as::<_, FailureRow>(&format!(
        r#"
        SELECT {FAILURE_COLUMNS}
        FROM automation_failures
        WHERE resolved_at IS NULL
        ORDER BY created_at ASC
        LIMIT $1
        "#
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn list_retryable(
    pool: &PgPool,
    channels: &[String],
    max_attempts: i32,
    limit: i64,
) -> Result<Vec<FailureRow>, sqlx::Error> {
    sqlx::query_as::<_, FailureRow>(&format!(
        r#"
        SELECT {FAILURE_COLUMNS}
        FROM automation_failures
        WHERE resolved_at IS NULL
          AND meta ->> 'channel' = ANY($1)
          AND attempts < $2
        ORDER BY COALESCE(last_attempt_at, created_at) ASC, created_at ASC
        LIMIT $3
        "#
    ))
    .bind(channels)
    .bind(max_attempts)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn mark_attempt(
    pool: &PgPool,
    id: &str,
    error_message: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE automation_failures
        SET attempts = attempts + 1,
            last_attempt_at = $2,
            error_message = $3
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(at)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn resolve(pool: &PgPool, id: &str, at: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE automation_failures
        SET resolved_at = $2
        WHERE id = $1 AND resolved_at IS NULL
        "#,
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

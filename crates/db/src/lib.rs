//! Postgres persistence for the booking core.

pub mod models;
pub mod queries;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, error, warn};
use tripdesk_core::error::StoreError;
use tripdesk_core::store::{
    ApplyOutcome, BookingChange, BookingStore, FailureStore, Filter, LeadStore, PaymentStore,
    RecordStore, WebhookWrite,
};
use tripdesk_core::types::{
    new_id, AutomationChannel, AutomationFailure, Booking, Lead, NewAutomationFailure, Payment,
    PaymentProvider, TransitionRecord, WebhookEventRecord,
};

use queries::records::RecordQueryError;

/// Store implementation over a shared Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Classifies a driver error by SQLSTATE, falling back to the message text.
pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(message),
                Some("42P01") | Some("42704") => StoreError::UndefinedCollection(message),
                Some("42703") => StoreError::UndefinedColumn(message),
                code => {
                    let mapped = StoreError::from_message(message);
                    debug!(
                        code = code.unwrap_or("none"),
                        error = %mapped,
                        "unrecognised sqlstate, classified by message"
                    );
                    mapped
                }
            }
        }
        sqlx::Error::RowNotFound => StoreError::InvalidRecord(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            error!(error = %err, "stored row failed to decode");
            StoreError::InvalidRecord(err.to_string())
        }
        _ => {
            warn!(error = %err, "database unavailable");
            StoreError::Unavailable(err.to_string())
        }
    }
}

fn map_record_error(err: RecordQueryError) -> StoreError {
    match err {
        RecordQueryError::Sql(err) => map_sqlx_error(err),
        other => StoreError::InvalidRecord(other.to_string()),
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn get_booking(&self, id: &str) -> Result<Option<Booking>, StoreError> {
        queries::bookings::get_by_id(&self.pool, id)
            .await
            .map_err(map_sqlx_error)?
            .map(Booking::try_from)
            .transpose()
    }

    async fn find_transition(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransitionRecord>, StoreError> {
        queries::bookings::find_transition(&self.pool, idempotency_key)
            .await
            .map_err(map_sqlx_error)?
            .map(TransitionRecord::try_from)
            .transpose()
    }

    async fn list_transitions(
        &self,
        booking_id: &str,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        queries::bookings::list_transitions(&self.pool, booking_id)
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(TransitionRecord::try_from)
            .collect()
    }

    async fn apply_transition(&self, change: BookingChange) -> Result<ApplyOutcome, StoreError> {
        match queries::bookings::apply_transition(&self.pool, &change).await {
            Ok(applied) => applied.into_outcome(),
            // Lost the race on the key between our lookup and the insert.
            Err(err) => match map_sqlx_error(err) {
                StoreError::UniqueViolation(_) => {
                    match self.find_transition(&change.record.idempotency_key).await? {
                        Some(existing) => Ok(ApplyOutcome::KeyTaken(existing)),
                        None => Ok(ApplyOutcome::StatusMoved),
                    }
                }
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        queries::payments::get_by_id(&self.pool, id)
            .await
            .map_err(map_sqlx_error)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, StoreError> {
        queries::payments::get_by_idempotency_key(&self.pool, key)
            .await
            .map_err(map_sqlx_error)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_by_provider_ref(
        &self,
        provider: PaymentProvider,
        provider_order_id: Option<&str>,
        provider_payment_intent_id: Option<&str>,
    ) -> Result<Option<Payment>, StoreError> {
        if provider_order_id.is_none() && provider_payment_intent_id.is_none() {
            return Ok(None);
        }
        queries::payments::get_by_provider_ref(
            &self.pool,
            provider.as_str(),
            provider_order_id,
            provider_payment_intent_id,
        )
        .await
        .map_err(map_sqlx_error)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn latest_for_booking(
        &self,
        booking_id: &str,
        provider: PaymentProvider,
    ) -> Result<Option<Payment>, StoreError> {
        queries::payments::latest_for_booking(&self.pool, booking_id, provider.as_str())
            .await
            .map_err(map_sqlx_error)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        queries::payments::create(&self.pool, payment)
            .await
            .map_err(map_sqlx_error)
    }

    async fn find_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError> {
        queries::payments::get_webhook_event(&self.pool, event_id)
            .await
            .map_err(map_sqlx_error)?
            .map(WebhookEventRecord::try_from)
            .transpose()
    }

    async fn record_webhook(
        &self,
        payment: &Payment,
        event: &WebhookEventRecord,
    ) -> Result<WebhookWrite, StoreError> {
        match queries::payments::record_webhook(&self.pool, payment, event)
            .await
            .map_err(map_sqlx_error)
        {
            Ok(Some(row)) => return Ok(WebhookWrite::Recorded(Payment::try_from(row)?)),
            Ok(None) | Err(StoreError::UniqueViolation(_)) => {
                debug!(event_id = %event.event_id, "webhook event already in ledger");
            }
            Err(err) => return Err(err),
        }
        let stored = self.get_payment(&payment.id).await?.ok_or_else(|| {
            StoreError::InvalidRecord(format!("payment {} missing after replay", payment.id))
        })?;
        Ok(WebhookWrite::AlreadyRecorded(stored))
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StoreError> {
        Ok(queries::leads::get_by_id(&self.pool, id)
            .await
            .map_err(map_sqlx_error)?
            .map(Lead::from))
    }
}

#[async_trait]
impl FailureStore for PgStore {
    async fn record_failure(
        &self,
        failure: NewAutomationFailure,
    ) -> Result<AutomationFailure, StoreError> {
        let row = queries::failures::create(&self.pool, &new_id("af"), &failure)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.into())
    }

    async fn get_failure(&self, id: &str) -> Result<Option<AutomationFailure>, StoreError> {
        Ok(queries::failures::get_by_id(&self.pool, id)
            .await
            .map_err(map_sqlx_error)?
            .map(AutomationFailure::from))
    }

    async fn list_unresolved(&self, limit: i64) -> Result<Vec<AutomationFailure>, StoreError> {
        Ok(queries::failures::list_unresolved(&self.pool, limit)
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(AutomationFailure::from)
            .collect())
    }

    async fn list_retryable(
        &self,
        channels: &[AutomationChannel],
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<AutomationFailure>, StoreError> {
        let channels: Vec<String> = channels.iter().map(|c| c.as_str().to_string()).collect();
        Ok(
            queries::failures::list_retryable(&self.pool, &channels, max_attempts, limit)
                .await
                .map_err(map_sqlx_error)?
                .into_iter()
                .map(AutomationFailure::from)
                .collect(),
        )
    }

    async fn mark_attempt(
        &self,
        id: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        queries::failures::mark_attempt(&self.pool, id, error_message, at)
            .await
            .map_err(map_sqlx_error)
    }

    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        queries::failures::resolve(&self.pool, id, at)
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn find_recent(
        &self,
        collection: &str,
        filter: &Filter,
        since: DateTime<Utc>,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        queries::records::find_recent(&self.pool, collection, filter, since)
            .await
            .map_err(map_record_error)
    }

    async fn insert(
        &self,
        collection: &str,
        record: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        queries::records::insert(&self.pool, collection, record)
            .await
            .map_err(map_record_error)
    }
}

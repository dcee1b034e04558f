//! Storage boundary for the booking core.
//!
//! Typed stores cover the tables the core owns outright. `RecordStore` is the
//! loosely-typed collection interface used where a deployment's schema may be
//! partially migrated (dedup reservations, the activity log, follow-up tasks).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::{
    AutomationChannel, AutomationFailure, Booking, Lead, LifecycleStatus, NewAutomationFailure, Payment,
    PaymentProvider, TransitionRecord, WebhookEventRecord,
};

pub use memory::MemoryStore;

/// Windowed dedup reservations, unique on `(dedup_key, window_start)`.
pub const DEDUP_COLLECTION: &str = "automation_dedup";
/// Append-only activity log; also holds fallback dedup markers.
pub const ACTIVITY_LOG_COLLECTION: &str = "activity_log";
pub const TASK_COLLECTION: &str = "crm_tasks";

/// A lifecycle change to commit atomically: the booking row (compare-and-set
/// on `expected_status`) and its transition record.
#[derive(Debug, Clone)]
pub struct BookingChange {
    pub booking: Booking,
    pub expected_status: LifecycleStatus,
    pub record: TransitionRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Booking),
    /// Another writer already committed this idempotency key.
    KeyTaken(TransitionRecord),
    /// The booking left `expected_status` before the write landed.
    StatusMoved,
    BookingMissing,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_booking(&self, id: &str) -> Result<Option<Booking>, StoreError>;

    async fn find_transition(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransitionRecord>, StoreError>;

    async fn list_transitions(&self, booking_id: &str)
        -> Result<Vec<TransitionRecord>, StoreError>;

    async fn apply_transition(&self, change: BookingChange) -> Result<ApplyOutcome, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookWrite {
    Recorded(Payment),
    /// The event id was already in the ledger; carries the stored payment.
    AlreadyRecorded(Payment),
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, StoreError>;

    async fn find_by_provider_ref(
        &self,
        provider: PaymentProvider,
        provider_order_id: Option<&str>,
        provider_payment_intent_id: Option<&str>,
    ) -> Result<Option<Payment>, StoreError>;

    async fn latest_for_booking(
        &self,
        booking_id: &str,
        provider: PaymentProvider,
    ) -> Result<Option<Payment>, StoreError>;

    /// Fails with `UniqueViolation` when the idempotency key is taken.
    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    async fn find_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError>;

    /// Appends the event to the ledger and upserts the payment in one unit.
    ///
    /// An existing row is combined with `Payment::merge_webhook` against its
    /// committed state, never the caller's earlier read. `Recorded` carries
    /// the row as stored.
    async fn record_webhook(
        &self,
        payment: &Payment,
        event: &WebhookEventRecord,
    ) -> Result<WebhookWrite, StoreError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StoreError>;
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn record_failure(
        &self,
        failure: NewAutomationFailure,
    ) -> Result<AutomationFailure, StoreError>;

    async fn get_failure(&self, id: &str) -> Result<Option<AutomationFailure>, StoreError>;

    async fn list_unresolved(&self, limit: i64) -> Result<Vec<AutomationFailure>, StoreError>;

    /// Unresolved failures on `channels` still under `max_attempts`, least
    /// recently attempted first.
    async fn list_retryable(
        &self,
        channels: &[AutomationChannel],
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<AutomationFailure>, StoreError>;

    async fn mark_attempt(
        &self,
        id: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns false when the failure does not exist or was already resolved.
    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Field { name: String, value: String },
    /// Matches a string key inside a JSON object column.
    Metadata {
        column: String,
        key: String,
        value: String,
    },
}

impl Filter {
    pub fn field(name: &str, value: &str) -> Self {
        Filter::Field {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn metadata(column: &str, key: &str, value: &str) -> Self {
        Filter::Metadata {
            column: column.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        match self {
            Filter::Field { name, value } => record
                .get(name)
                .and_then(Value::as_str)
                .is_some_and(|found| found == value),
            Filter::Metadata { column, key, value } => record
                .get(column)
                .and_then(|meta| meta.get(key))
                .and_then(Value::as_str)
                .is_some_and(|found| found == value),
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// First record matching `filter` whose `created_at` is at or after `since`.
    async fn find_recent(
        &self,
        collection: &str,
        filter: &Filter,
        since: DateTime<Utc>,
    ) -> Result<Option<Map<String, Value>>, StoreError>;

    async fn insert(&self, collection: &str, record: &Map<String, Value>)
        -> Result<(), StoreError>;
}

/// Inserts the first candidate shape the collection accepts.
///
/// Shapes rejected for naming an unknown column are skipped. Any other error,
/// including a uniqueness violation, ends the ladder and is returned as-is.
/// Returns the index of the accepted shape.
pub async fn insert_first_accepted(
    store: &dyn RecordStore,
    collection: &str,
    shapes: &[Map<String, Value>],
) -> Result<usize, StoreError> {
    let mut last_err = StoreError::InvalidRecord(format!("no candidate shapes for {collection}"));
    for (index, shape) in shapes.iter().enumerate() {
        match store.insert(collection, shape).await {
            Ok(()) => return Ok(index),
            Err(err @ StoreError::UndefinedColumn(_)) => {
                tracing::debug!(collection, shape = index, error = %err, "candidate shape rejected");
                last_err = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err)
}

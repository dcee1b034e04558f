use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{
    ApplyOutcome, BookingChange, BookingStore, FailureStore, Filter, LeadStore, PaymentStore,
    RecordStore, WebhookWrite, ACTIVITY_LOG_COLLECTION, DEDUP_COLLECTION, TASK_COLLECTION,
};
use crate::error::StoreError;
use crate::types::{
    new_id, AutomationChannel, AutomationFailure, Booking, Lead, NewAutomationFailure, Payment,
    PaymentProvider, TransitionRecord, WebhookEventRecord,
};

#[derive(Debug, Clone, Default)]
struct Collection {
    /// `None` accepts any field.
    columns: Option<HashSet<String>>,
    unique: Vec<Vec<String>>,
    rows: Vec<Map<String, Value>>,
}

impl Collection {
    fn violates_unique(&self, record: &Map<String, Value>) -> Option<String> {
        for fields in &self.unique {
            let candidate: Option<Vec<&Value>> = fields
                .iter()
                .map(|field| record.get(field).filter(|v| !v.is_null()))
                .collect();
            let Some(candidate) = candidate else {
                continue;
            };
            let clash = self.rows.iter().any(|row| {
                fields
                    .iter()
                    .zip(candidate.iter())
                    .all(|(field, value)| row.get(field) == Some(*value))
            });
            if clash {
                return Some(fields.join(", "));
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct State {
    bookings: HashMap<String, Booking>,
    transitions: Vec<TransitionRecord>,
    payments: Vec<Payment>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    leads: HashMap<String, Lead>,
    failures: Vec<AutomationFailure>,
    collections: HashMap<String, Collection>,
    injected: HashMap<String, StoreError>,
}

impl State {
    fn take_injected(&mut self, op: &str) -> Result<(), StoreError> {
        match self.injected.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory implementation of every store trait.
///
/// Intended for tests and local development. Collections mimic a relational
/// schema closely enough to exercise the candidate-shape ladder: unknown
/// collections and columns are rejected, and unique field sets are enforced.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// A store with the fully migrated collection schema.
    pub fn new() -> Self {
        Self::default()
            .with_collection(
                DEDUP_COLLECTION,
                &[
                    "dedup_key",
                    "event",
                    "entity_id",
                    "scope_value",
                    "window_start",
                    "created_at",
                ],
                &[&["dedup_key", "window_start"]],
            )
            .with_collection(
                ACTIVITY_LOG_COLLECTION,
                &["id", "event", "entity_id", "metadata", "created_at"],
                &[],
            )
            .with_collection(
                TASK_COLLECTION,
                &[
                    "id",
                    "lead_id",
                    "booking_id",
                    "title",
                    "due_at",
                    "source",
                    "dedup_key",
                    "status",
                    "created_at",
                ],
                &[&["dedup_key"]],
            )
    }

    pub fn with_collection(self, name: &str, columns: &[&str], unique: &[&[&str]]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.collections.insert(
                name.to_string(),
                Collection {
                    columns: Some(columns.iter().map(|c| c.to_string()).collect()),
                    unique: unique
                        .iter()
                        .map(|set| set.iter().map(|f| f.to_string()).collect())
                        .collect(),
                    rows: Vec::new(),
                },
            );
        }
        self
    }

    pub fn without_collection(self, name: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.collections.remove(name);
        }
        self
    }

    /// Makes the next call of `op` fail with `err`.
    ///
    /// Operation names are the trait method names; collection operations are
    /// qualified, e.g. `insert:automation_dedup`.
    pub fn fail_next(&self, op: &str, err: StoreError) {
        if let Ok(mut state) = self.state.lock() {
            state.injected.insert(op.to_string(), err);
        }
    }

    pub fn insert_booking(&self, booking: Booking) {
        if let Ok(mut state) = self.state.lock() {
            state.bookings.insert(booking.id.clone(), booking);
        }
    }

    pub fn insert_lead(&self, lead: Lead) {
        if let Ok(mut state) = self.state.lock() {
            state.leads.insert(lead.id.clone(), lead);
        }
    }

    pub fn booking(&self, id: &str) -> Option<Booking> {
        self.state.lock().ok()?.bookings.get(id).cloned()
    }

    pub fn transitions_for(&self, booking_id: &str) -> Vec<TransitionRecord> {
        self.state
            .lock()
            .map(|state| {
                state
                    .transitions
                    .iter()
                    .filter(|record| record.booking_id == booking_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn payments_for(&self, booking_id: &str) -> Vec<Payment> {
        self.state
            .lock()
            .map(|state| {
                state
                    .payments
                    .iter()
                    .filter(|payment| payment.booking_id == booking_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn collection_rows(&self, name: &str) -> Vec<Map<String, Value>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.collections.get(name).map(|c| c.rows.clone()))
            .unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<AutomationFailure> {
        self.state
            .lock()
            .map(|state| state.failures.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

fn created_at_of(record: &Map<String, Value>) -> Option<DateTime<Utc>> {
    record
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn get_booking(&self, id: &str) -> Result<Option<Booking>, StoreError> {
        let mut state = self.lock()?;
        state.take_injected("get_booking")?;
        Ok(state.bookings.get(id).cloned())
    }

    async fn find_transition(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransitionRecord>, StoreError> {
        let mut state = self.lock()?;
        state.take_injected("find_transition")?;
        Ok(state
            .transitions
            .iter()
            .find(|record| record.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn list_transitions(
        &self,
        booking_id: &str,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .transitions
            .iter()
            .filter(|record| record.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn apply_transition(&self, change: BookingChange) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.lock()?;
        state.take_injected("apply_transition")?;

        if let Some(existing) = state
            .transitions
            .iter()
            .find(|record| record.idempotency_key == change.record.idempotency_key)
        {
            return Ok(ApplyOutcome::KeyTaken(existing.clone()));
        }

        let Some(current) = state.bookings.get(&change.booking.id) else {
            return Ok(ApplyOutcome::BookingMissing);
        };
        if current.lifecycle_status != change.expected_status {
            return Ok(ApplyOutcome::StatusMoved);
        }

        state
            .bookings
            .insert(change.booking.id.clone(), change.booking.clone());
        state.transitions.push(change.record);
        Ok(ApplyOutcome::Applied(change.booking))
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        let state = self.lock()?;
        Ok(state.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .payments
            .iter()
            .find(|p| p.idempotency_key == key)
            .cloned())
    }

    async fn find_by_provider_ref(
        &self,
        provider: PaymentProvider,
        provider_order_id: Option<&str>,
        provider_payment_intent_id: Option<&str>,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .payments
            .iter()
            .find(|p| {
                p.provider == provider
                    && ((provider_order_id.is_some()
                        && p.provider_order_id.as_deref() == provider_order_id)
                        || (provider_payment_intent_id.is_some()
                            && p.provider_payment_intent_id.as_deref()
                                == provider_payment_intent_id))
            })
            .cloned())
    }

    async fn latest_for_booking(
        &self,
        booking_id: &str,
        provider: PaymentProvider,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.booking_id == booking_id && p.provider == provider)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.take_injected("insert_payment")?;
        if state
            .payments
            .iter()
            .any(|p| p.idempotency_key == payment.idempotency_key)
        {
            return Err(StoreError::UniqueViolation(format!(
                "payments.idempotency_key = {}",
                payment.idempotency_key
            )));
        }
        state.payments.push(payment.clone());
        Ok(())
    }

    async fn find_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.webhook_events.get(event_id).cloned())
    }

    async fn record_webhook(
        &self,
        payment: &Payment,
        event: &WebhookEventRecord,
    ) -> Result<WebhookWrite, StoreError> {
        let mut state = self.lock()?;
        state.take_injected("record_webhook")?;

        if let Some(existing) = state.webhook_events.get(&event.event_id) {
            let stored = state
                .payments
                .iter()
                .find(|p| p.id == existing.payment_id)
                .cloned()
                .ok_or_else(|| {
                    StoreError::InvalidRecord(format!(
                        "webhook event {} points at missing payment",
                        event.event_id
                    ))
                })?;
            return Ok(WebhookWrite::AlreadyRecorded(stored));
        }

        let stored = match state.payments.iter().position(|p| p.id == payment.id) {
            Some(index) => {
                let merged = state.payments[index].merge_webhook(payment);
                state.payments[index] = merged.clone();
                merged
            }
            None => {
                if state
                    .payments
                    .iter()
                    .any(|p| p.idempotency_key == payment.idempotency_key)
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "payments.idempotency_key = {}",
                        payment.idempotency_key
                    )));
                }
                state.payments.push(payment.clone());
                payment.clone()
            }
        };
        state
            .webhook_events
            .insert(event.event_id.clone(), event.clone());
        Ok(WebhookWrite::Recorded(stored))
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StoreError> {
        let mut state = self.lock()?;
        state.take_injected("get_lead")?;
        Ok(state.leads.get(id).cloned())
    }
}

#[async_trait]
impl FailureStore for MemoryStore {
    async fn record_failure(
        &self,
        failure: NewAutomationFailure,
    ) -> Result<AutomationFailure, StoreError> {
        let mut state = self.lock()?;
        state.take_injected("record_failure")?;
        let stored = AutomationFailure {
            id: new_id("af"),
            booking_id: failure.booking_id,
            event: failure.event,
            error_message: failure.error_message,
            payload: failure.payload,
            meta: failure.meta,
            attempts: 0,
            last_attempt_at: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        state.failures.push(stored.clone());
        Ok(stored)
    }

    async fn get_failure(&self, id: &str) -> Result<Option<AutomationFailure>, StoreError> {
        let state = self.lock()?;
        Ok(state.failures.iter().find(|f| f.id == id).cloned())
    }

    async fn list_unresolved(&self, limit: i64) -> Result<Vec<AutomationFailure>, StoreError> {
        let state = self.lock()?;
        let mut unresolved: Vec<AutomationFailure> = state
            .failures
            .iter()
            .filter(|f| f.resolved_at.is_none())
            .cloned()
            .collect();
        unresolved.sort_by_key(|f| f.created_at);
        unresolved.truncate(limit.max(0) as usize);
        Ok(unresolved)
    }

    async fn list_retryable(
        &self,
        channels: &[AutomationChannel],
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<AutomationFailure>, StoreError> {
        let state = self.lock()?;
        let mut retryable: Vec<AutomationFailure> = state
            .failures
            .iter()
            .filter(|f| f.resolved_at.is_none() && f.attempts < max_attempts)
            .filter(|f| f.automation_channel().is_some_and(|c| channels.contains(&c)))
            .cloned()
            .collect();
        retryable.sort_by_key(|f| (f.last_attempt_at.unwrap_or(f.created_at), f.created_at));
        retryable.truncate(limit.max(0) as usize);
        Ok(retryable)
    }

    async fn mark_attempt(
        &self,
        id: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(failure) = state.failures.iter_mut().find(|f| f.id == id) {
            failure.attempts += 1;
            failure.last_attempt_at = Some(at);
            failure.error_message = error_message.to_string();
        }
        Ok(())
    }

    async fn resolve(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state
            .failures
            .iter_mut()
            .find(|f| f.id == id && f.resolved_at.is_none())
        {
            Some(failure) => {
                failure.resolved_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_recent(
        &self,
        collection: &str,
        filter: &Filter,
        since: DateTime<Utc>,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        let mut state = self.lock()?;
        state.take_injected(&format!("find_recent:{collection}"))?;
        let table = state
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::UndefinedCollection(collection.to_string()))?;
        Ok(table
            .rows
            .iter()
            .find(|row| filter.matches(row) && created_at_of(row).is_some_and(|ts| ts >= since))
            .cloned())
    }

    async fn insert(
        &self,
        collection: &str,
        record: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.take_injected(&format!("insert:{collection}"))?;
        let table = state
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UndefinedCollection(collection.to_string()))?;

        if let Some(columns) = &table.columns {
            if let Some(unknown) = record.keys().find(|key| !columns.contains(*key)) {
                return Err(StoreError::UndefinedColumn(format!("{collection}.{unknown}")));
            }
        }
        if let Some(fields) = table.violates_unique(record) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key value violates unique constraint on {collection} ({fields})"
            )));
        }
        table.rows.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BookingPaymentStatus, LifecycleStatus};
    use serde_json::json;

    fn booking(id: &str) -> Booking {
        let now = Utc::now();
        Booking {
            id: id.to_string(),
            lead_id: None,
            lifecycle_status: LifecycleStatus::BookingCreated,
            payment_status: BookingPaymentStatus::Unpaid,
            gross_amount: 100.0,
            paid_amount: 0.0,
            due_amount: 100.0,
            refund_amount: 0.0,
            currency: "INR".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let store = MemoryStore::new();
        store.insert_booking(booking("bk_1"));
        store.fail_next("get_booking", StoreError::Unavailable("down".into()));

        assert!(store.get_booking("bk_1").await.is_err());
        assert!(store.get_booking("bk_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unique_fields_with_null_do_not_clash() {
        let store = MemoryStore::new();
        let row = json!({"dedup_key": "k", "created_at": "2026-01-01T00:00:00Z"});
        let row = row.as_object().unwrap();
        store.insert(DEDUP_COLLECTION, row).await.unwrap();
        // window_start absent: the composite unique index cannot fire
        store.insert(DEDUP_COLLECTION, row).await.unwrap();
        assert_eq!(store.collection_rows(DEDUP_COLLECTION).len(), 2);
    }

    #[tokio::test]
    async fn test_find_recent_respects_since() {
        let store = MemoryStore::new();
        let row = json!({"dedup_key": "k", "window_start": "w", "created_at": "2026-01-01T00:00:00Z"});
        store
            .insert(DEDUP_COLLECTION, row.as_object().unwrap())
            .await
            .unwrap();

        let filter = Filter::field("dedup_key", "k");
        let early: DateTime<Utc> = "2025-12-31T00:00:00Z".parse().unwrap();
        let late: DateTime<Utc> = "2026-01-02T00:00:00Z".parse().unwrap();
        assert!(store.find_recent(DEDUP_COLLECTION, &filter, early).await.unwrap().is_some());
        assert!(store.find_recent(DEDUP_COLLECTION, &filter, late).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let store = MemoryStore::new();
        let failure = store
            .record_failure(NewAutomationFailure {
                booking_id: None,
                event: "e".into(),
                error_message: "x".into(),
                payload: json!({}),
                meta: json!({}),
            })
            .await
            .unwrap();

        assert!(store.resolve(&failure.id, Utc::now()).await.unwrap());
        assert!(!store.resolve(&failure.id, Utc::now()).await.unwrap());
        assert!(store.list_unresolved(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_retryable_filters_channel_and_cap() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for channel in ["lifecycle", "messaging", "contact_sync", "lead_not_found"] {
            let failure = store
                .record_failure(NewAutomationFailure {
                    booking_id: None,
                    event: "e".into(),
                    error_message: "x".into(),
                    payload: json!({}),
                    meta: json!({"channel": channel}),
                })
                .await
                .unwrap();
            ids.push(failure.id);
        }
        store.mark_attempt(&ids[2], "down", Utc::now()).await.unwrap();
        store.mark_attempt(&ids[2], "down", Utc::now()).await.unwrap();

        let found = store
            .list_retryable(&AutomationChannel::RETRYABLE, 2, 10)
            .await
            .unwrap();
        let found: Vec<&str> = found.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(found, vec![ids[1].as_str()]);

        let found = store
            .list_retryable(&AutomationChannel::RETRYABLE, 5, 10)
            .await
            .unwrap();
        // least recently attempted first
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, ids[1]);
    }
}

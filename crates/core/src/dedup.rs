//! At-most-once reservation of side effects per `(event, entity, scope)`.
//!
//! Reservations live in the dedicated `automation_dedup` collection when the
//! deployment has it. Older schemas may lack the collection or some of its
//! columns, so inserts walk a ladder of candidate shapes, and when none fits
//! the reservation falls back to a marker row in `activity_log`.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{
    insert_first_accepted, Filter, RecordStore, ACTIVITY_LOG_COLLECTION, DEDUP_COLLECTION,
};
use crate::types::new_id;

pub const DEFAULT_WINDOW_DAYS: i64 = 7;
const ACTIVITY_MARKER_EVENT: &str = "automation_dedup_reserved";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub dedup_key: String,
    pub event: String,
    pub entity_id: String,
    pub scope_value: String,
    pub window_days: i64,
}

impl ReserveRequest {
    pub fn new(
        dedup_key: impl Into<String>,
        event: impl Into<String>,
        entity_id: impl Into<String>,
        scope_value: impl Into<String>,
    ) -> Self {
        Self {
            dedup_key: dedup_key.into(),
            event: event.into(),
            entity_id: entity_id.into(),
            scope_value: scope_value.into(),
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }

    pub fn with_window_days(mut self, window_days: i64) -> Self {
        self.window_days = window_days;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageUsed {
    Dedicated,
    ActivityLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveReason {
    Reserved,
    DuplicateWithinWindow,
    /// A concurrent reserver inserted the same key first.
    LostRace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub should_run: bool,
    pub deduped: bool,
    pub storage_used: StorageUsed,
    pub reason: ReserveReason,
}

impl Reservation {
    fn reserved(storage_used: StorageUsed) -> Self {
        Self {
            should_run: true,
            deduped: false,
            storage_used,
            reason: ReserveReason::Reserved,
        }
    }

    fn duplicate(storage_used: StorageUsed, reason: ReserveReason) -> Self {
        Self {
            should_run: false,
            deduped: true,
            storage_used,
            reason,
        }
    }
}

#[derive(Clone)]
pub struct DedupReserver {
    store: Arc<dyn RecordStore>,
}

impl DedupReserver {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn reserve(&self, request: &ReserveRequest) -> Result<Reservation, StoreError> {
        self.reserve_at(request, Utc::now()).await
    }

    pub async fn reserve_at(
        &self,
        request: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let window_days = request.window_days.max(1);
        let since = now - Duration::days(window_days);

        match self
            .store
            .find_recent(
                DEDUP_COLLECTION,
                &Filter::field("dedup_key", &request.dedup_key),
                since,
            )
            .await
        {
            Ok(Some(_)) => {
                return Ok(Reservation::duplicate(
                    StorageUsed::Dedicated,
                    ReserveReason::DuplicateWithinWindow,
                ))
            }
            Ok(None) => {}
            Err(err) if err.is_schema_mismatch() => {
                warn!(error = %err, dedup_key = %request.dedup_key, "dedup collection unavailable, using activity log");
                return self.reserve_in_activity_log(request, since, now).await;
            }
            Err(err) => return Err(err),
        }

        let shapes = dedicated_shapes(request, now, window_days);
        match insert_first_accepted(self.store.as_ref(), DEDUP_COLLECTION, &shapes).await {
            Ok(shape) => {
                debug!(dedup_key = %request.dedup_key, shape, "dedup slot reserved");
                Ok(Reservation::reserved(StorageUsed::Dedicated))
            }
            Err(err) if err.is_unique_violation() => {
                info!(dedup_key = %request.dedup_key, "dedup slot taken by concurrent reserver");
                Ok(Reservation::duplicate(
                    StorageUsed::Dedicated,
                    ReserveReason::LostRace,
                ))
            }
            Err(err) if err.is_schema_mismatch() => {
                warn!(error = %err, dedup_key = %request.dedup_key, "dedup collection rejected every shape, using activity log");
                self.reserve_in_activity_log(request, since, now).await
            }
            Err(err) => Err(err),
        }
    }

    async fn reserve_in_activity_log(
        &self,
        request: &ReserveRequest,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let existing = self
            .store
            .find_recent(
                ACTIVITY_LOG_COLLECTION,
                &Filter::metadata("metadata", "dedup_key", &request.dedup_key),
                since,
            )
            .await?;
        if existing.is_some() {
            return Ok(Reservation::duplicate(
                StorageUsed::ActivityLog,
                ReserveReason::DuplicateWithinWindow,
            ));
        }

        let marker = object(json!({
            "id": new_id("act"),
            "event": ACTIVITY_MARKER_EVENT,
            "entity_id": request.entity_id,
            "metadata": {
                "dedup_key": request.dedup_key,
                "event": request.event,
                "scope_value": request.scope_value,
            },
            "created_at": now.to_rfc3339(),
        }));
        self.store.insert(ACTIVITY_LOG_COLLECTION, &marker).await?;
        Ok(Reservation::reserved(StorageUsed::ActivityLog))
    }
}

/// Start of the fixed bucket of `window_days` that contains `now`.
pub fn window_start(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    let length = window_days.max(1) * 86_400;
    let bucket = now.timestamp().div_euclid(length) * length;
    Utc.timestamp_opt(bucket, 0).single().unwrap_or(now)
}

fn dedicated_shapes(
    request: &ReserveRequest,
    now: DateTime<Utc>,
    window_days: i64,
) -> Vec<Map<String, Value>> {
    let created_at = now.to_rfc3339();
    let window = window_start(now, window_days).to_rfc3339();
    vec![
        object(json!({
            "dedup_key": request.dedup_key,
            "event": request.event,
            "entity_id": request.entity_id,
            "scope_value": request.scope_value,
            "window_start": window,
            "created_at": created_at,
        })),
        object(json!({
            "dedup_key": request.dedup_key,
            "event": request.event,
            "entity_id": request.entity_id,
            "window_start": window,
            "created_at": created_at,
        })),
        object(json!({
            "dedup_key": request.dedup_key,
            "created_at": created_at,
        })),
    ]
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

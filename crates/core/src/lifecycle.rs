//! Booking lifecycle state machine.
//!
//! Every transition carries a mandatory idempotency key. The first commit for
//! a key wins; later requests with the same key observe that commit and apply
//! nothing. Legal moves come from an explicit [`TransitionGraph`] and anything
//! not listed is rejected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ConfigError, LifecycleError};
use crate::store::{ApplyOutcome, BookingChange, BookingStore};
use crate::types::{
    new_id, ActorType, Booking, BookingPaymentStatus, LifecycleStatus, TransitionRecord,
};

const MAX_APPLY_ATTEMPTS: usize = 3;

pub static DEFAULT_GRAPH: Lazy<TransitionGraph> = Lazy::new(|| {
    use LifecycleStatus::*;
    TransitionGraph::from_edges(&[
        (BookingCreated, PaymentPending),
        (BookingCreated, PaymentConfirmed),
        (BookingCreated, Cancelled),
        (PaymentPending, PaymentConfirmed),
        (PaymentPending, Cancelled),
        (PaymentConfirmed, Fulfilled),
        (PaymentConfirmed, Cancelled),
        (PaymentConfirmed, Refunded),
        (Fulfilled, Completed),
        (Fulfilled, Refunded),
        (Completed, Refunded),
        (Cancelled, Refunded),
    ])
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionGraph {
    edges: HashMap<LifecycleStatus, HashSet<LifecycleStatus>>,
}

impl TransitionGraph {
    pub fn from_edges(edges: &[(LifecycleStatus, LifecycleStatus)]) -> Self {
        let mut graph = Self::default();
        for (from, to) in edges {
            graph.allow(*from, *to);
        }
        graph
    }

    pub fn allow(&mut self, from: LifecycleStatus, to: LifecycleStatus) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn allows(&self, from: LifecycleStatus, to: LifecycleStatus) -> bool {
        self.edges.get(&from).is_some_and(|next| next.contains(&to))
    }

    /// Default graph plus any configured extra edges.
    pub fn configured(extra: Option<&str>) -> Result<Self, ConfigError> {
        let mut graph = DEFAULT_GRAPH.clone();
        if let Some(edges) = extra {
            graph.extend_from_list(edges)?;
        }
        Ok(graph)
    }

    /// Adds edges written as `from>to,from>to`.
    pub fn extend_from_list(&mut self, edges: &str) -> Result<(), ConfigError> {
        for pair in edges.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (from, to) = pair.split_once('>').ok_or_else(|| ConfigError::Invalid {
                key: "LIFECYCLE_EXTRA_TRANSITIONS",
                reason: format!("'{pair}' is not of the form from>to"),
            })?;
            let parse = |raw: &str| {
                raw.trim()
                    .parse::<LifecycleStatus>()
                    .map_err(|err| ConfigError::Invalid {
                        key: "LIFECYCLE_EXTRA_TRANSITIONS",
                        reason: err.to_string(),
                    })
            };
            self.allow(parse(from)?, parse(to)?);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub booking_id: String,
    pub to_status: LifecycleStatus,
    pub actor_type: ActorType,
    pub idempotency_key: String,
    pub note: Option<String>,
    pub metadata: Value,
}

impl TransitionRequest {
    pub fn new(
        booking_id: impl Into<String>,
        to_status: LifecycleStatus,
        actor_type: ActorType,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            booking_id: booking_id.into(),
            to_status,
            actor_type,
            idempotency_key: idempotency_key.into(),
            note: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    /// A record for the idempotency key already existed.
    Replayed,
    /// The booking was already in the requested status; nothing was written.
    AlreadyInState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionResult {
    pub outcome: TransitionOutcome,
    pub booking: Booking,
    pub record: Option<TransitionRecord>,
}

impl TransitionResult {
    pub fn changed(&self) -> bool {
        self.outcome == TransitionOutcome::Applied
    }
}

#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn BookingStore>,
    graph: TransitionGraph,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self::with_graph(store, DEFAULT_GRAPH.clone())
    }

    pub fn with_graph(store: Arc<dyn BookingStore>, graph: TransitionGraph) -> Self {
        Self { store, graph }
    }

    pub fn graph(&self) -> &TransitionGraph {
        &self.graph
    }

    pub async fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<TransitionResult, LifecycleError> {
        if request.idempotency_key.trim().is_empty() {
            return Err(LifecycleError::MissingIdempotencyKey);
        }

        for _ in 0..MAX_APPLY_ATTEMPTS {
            if let Some(record) = self.store.find_transition(&request.idempotency_key).await? {
                return self.replay(record).await;
            }

            let booking = self
                .store
                .get_booking(&request.booking_id)
                .await?
                .ok_or_else(|| LifecycleError::BookingNotFound(request.booking_id.clone()))?;

            let from = booking.lifecycle_status;
            if from == request.to_status {
                return Ok(TransitionResult {
                    outcome: TransitionOutcome::AlreadyInState,
                    booking,
                    record: None,
                });
            }
            if !self.graph.allows(from, request.to_status) {
                warn!(
                    booking_id = %booking.id,
                    from = %from,
                    to = %request.to_status,
                    "rejected lifecycle transition"
                );
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: request.to_status,
                });
            }

            let now = Utc::now();
            let record = TransitionRecord {
                id: new_id("ltr"),
                booking_id: booking.id.clone(),
                from_status: from,
                to_status: request.to_status,
                actor_type: request.actor_type,
                idempotency_key: request.idempotency_key.clone(),
                note: request.note.clone(),
                metadata: request.metadata.clone(),
                created_at: now,
            };
            let mut next = settle(&booking, request.to_status, &request.metadata);
            next.updated_at = now;

            let change = BookingChange {
                booking: next,
                expected_status: from,
                record: record.clone(),
            };
            match self.store.apply_transition(change).await? {
                ApplyOutcome::Applied(booking) => {
                    info!(
                        booking_id = %booking.id,
                        from = %from,
                        to = %record.to_status,
                        actor = %record.actor_type,
                        idempotency_key = %record.idempotency_key,
                        "lifecycle transition applied"
                    );
                    return Ok(TransitionResult {
                        outcome: TransitionOutcome::Applied,
                        booking,
                        record: Some(record),
                    });
                }
                ApplyOutcome::KeyTaken(existing) => return self.replay(existing).await,
                ApplyOutcome::BookingMissing => {
                    return Err(LifecycleError::BookingNotFound(request.booking_id.clone()))
                }
                ApplyOutcome::StatusMoved => {
                    warn!(
                        booking_id = %request.booking_id,
                        "booking status moved during transition, re-evaluating"
                    );
                }
            }
        }

        Err(LifecycleError::Persistence(
            crate::error::StoreError::Unavailable(format!(
                "booking {} kept changing during transition",
                request.booking_id
            )),
        ))
    }

    async fn replay(&self, record: TransitionRecord) -> Result<TransitionResult, LifecycleError> {
        let booking = self
            .store
            .get_booking(&record.booking_id)
            .await?
            .ok_or_else(|| LifecycleError::BookingNotFound(record.booking_id.clone()))?;
        Ok(TransitionResult {
            outcome: TransitionOutcome::Replayed,
            booking,
            record: Some(record),
        })
    }
}

/// Booking fields that follow from entering `to`.
fn settle(booking: &Booking, to: LifecycleStatus, metadata: &Value) -> Booking {
    let mut next = booking.clone();
    next.lifecycle_status = to;
    match to {
        LifecycleStatus::PaymentPending => {
            next.payment_status = BookingPaymentStatus::Pending;
        }
        LifecycleStatus::PaymentConfirmed => {
            next.payment_status = BookingPaymentStatus::Paid;
            if let Some(paid) = metadata.get("amount_paid").and_then(Value::as_f64) {
                next.paid_amount += paid;
                next.due_amount = (next.gross_amount - next.paid_amount).max(0.0);
            }
        }
        LifecycleStatus::Refunded => {
            next.payment_status = BookingPaymentStatus::Refunded;
            if let Some(refunded) = metadata.get("amount_refunded").and_then(Value::as_f64) {
                next.refund_amount = refunded;
            }
        }
        _ => {}
    }
    next
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::*;
use crate::error::{ChannelError, DispatchError, StoreError};
use crate::store::TASK_COLLECTION;
use crate::store::{FailureStore, MemoryStore};
use crate::types::{Booking, BookingPaymentStatus, LifecycleStatus, NewAutomationFailure};

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Reject,
    Hang,
}

struct FakeMessaging {
    behaviour: Behaviour,
    sent: Mutex<Vec<TemplateMessage>>,
}

impl FakeMessaging {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<TemplateMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingProvider for FakeMessaging {
    async fn send_template(&self, message: &TemplateMessage) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(message.clone());
        respond(self.behaviour).await
    }
}

struct FakeContactSync {
    behaviour: Behaviour,
    upserts: Mutex<Vec<ContactUpsert>>,
}

impl FakeContactSync {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            upserts: Mutex::new(Vec::new()),
        })
    }

    fn upserts(&self) -> Vec<ContactUpsert> {
        self.upserts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContactSyncProvider for FakeContactSync {
    async fn upsert_contact(&self, contact: &ContactUpsert) -> Result<(), ChannelError> {
        self.upserts.lock().unwrap().push(contact.clone());
        respond(self.behaviour).await
    }
}

async fn respond(behaviour: Behaviour) -> Result<(), ChannelError> {
    match behaviour {
        Behaviour::Succeed => Ok(()),
        Behaviour::Reject => Err(ChannelError::Rejected {
            status: 422,
            body: "template not approved".into(),
        }),
        Behaviour::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }
}

fn lead() -> Lead {
    Lead {
        id: "ld_1".into(),
        name: "Asha".into(),
        email: Some("asha@example.com".into()),
        phone: Some("+919800000000".into()),
        stage: Some("new".into()),
    }
}

fn store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_lead(lead());
    store
}

fn dispatcher(store: &Arc<MemoryStore>) -> Dispatcher {
    Dispatcher::new(store.clone(), store.clone(), store.clone(), store.clone())
}

fn events(channels: &[ChannelReport]) -> Vec<Option<&'static str>> {
    channels.iter().map(ChannelReport::event).collect()
}

#[tokio::test]
async fn test_lead_created_twice_is_deduped() {
    let store = store();
    let messaging = FakeMessaging::new(Behaviour::Succeed);
    let dispatcher = dispatcher(&store).with_messaging(messaging.clone());
    let request = AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1");

    let first = dispatcher.dispatch(request.clone()).await.unwrap();
    let second = dispatcher.dispatch(request).await.unwrap();

    assert!(matches!(first, DispatchOutcome::Completed { failures: 0, .. }));
    assert_eq!(
        second,
        DispatchOutcome::Deduped {
            dedup_key: "crm_auto:lead.created:ld_1:created".into()
        }
    );
    assert_eq!(messaging.sent().len(), 1);
    assert_eq!(messaging.sent()[0].template, "lead_welcome");
    assert_eq!(store.collection_rows(TASK_COLLECTION).len(), 1);
}

#[tokio::test]
async fn test_missing_messaging_config_does_not_block_contact_sync() {
    let store = store();
    let contacts = FakeContactSync::new(Behaviour::Succeed);
    let dispatcher = dispatcher(&store).with_contact_sync(contacts.clone());

    let outcome = dispatcher
        .dispatch(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1"))
        .await
        .unwrap();

    let DispatchOutcome::Completed {
        failures, channels, ..
    } = outcome
    else {
        panic!("expected completed dispatch");
    };
    assert_eq!(failures, 0);
    assert_eq!(
        events(&channels),
        vec![
            Some("messaging_skipped_missing_config"),
            Some("contact_sync_upsert_success"),
            Some("follow_up_task_created"),
        ]
    );
    let upserts = contacts.upserts();
    assert_eq!(upserts[0].email, "asha@example.com");
    assert_eq!(upserts[0].tags, vec!["lead", "stage:new", "event:lead_created"]);
    assert!(store.failures().is_empty());
}

#[tokio::test]
async fn test_failing_channel_is_recorded_without_stopping_others() {
    let store = store();
    let messaging = FakeMessaging::new(Behaviour::Reject);
    let contacts = FakeContactSync::new(Behaviour::Succeed);
    let dispatcher = dispatcher(&store)
        .with_messaging(messaging)
        .with_contact_sync(contacts.clone());

    let outcome = dispatcher
        .dispatch(
            AutomationRequest::for_lead(AutomationEvent::QuoteSent, "ld_1")
                .with_payload(json!({"quote_id": "q_7"})),
        )
        .await
        .unwrap();

    let DispatchOutcome::Completed {
        dedup_key,
        failures,
        channels,
    } = outcome
    else {
        panic!("expected completed dispatch");
    };
    assert_eq!(dedup_key, "crm_auto:quote.sent:ld_1:q_7");
    assert_eq!(failures, 1);
    assert!(channels[0].is_failure());
    assert_eq!(contacts.upserts().len(), 1);
    assert_eq!(store.collection_rows(TASK_COLLECTION).len(), 1);

    let recorded = store.failures();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event, dedup_key);
    assert_eq!(recorded[0].channel(), Some("messaging"));
    assert_eq!(recorded[0].meta["dedup_key"], json!(dedup_key));
    assert_eq!(recorded[0].payload["payload"]["quote_id"], "q_7");
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let store = store();
    let dispatcher = dispatcher(&store)
        .with_messaging(FakeMessaging::new(Behaviour::Hang))
        .with_contact_sync(FakeContactSync::new(Behaviour::Succeed))
        .with_timeout(Duration::from_millis(50));

    let outcome = dispatcher
        .dispatch(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1"))
        .await
        .unwrap();

    let DispatchOutcome::Completed {
        failures, channels, ..
    } = outcome
    else {
        panic!("expected completed dispatch");
    };
    assert_eq!(failures, 1);
    assert_eq!(
        channels[0].outcome,
        ChannelOutcome::Failed {
            error: ChannelError::Timeout(0).to_string()
        }
    );
    assert_eq!(channels[1].event(), Some("contact_sync_upsert_success"));
}

#[tokio::test]
async fn test_unknown_lead_is_skipped_and_recorded() {
    let store = store();
    let outcome = dispatcher(&store)
        .dispatch(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_missing"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Skipped {
            reason: SkipReason::LeadNotFound
        }
    );
    let recorded = store.failures();
    assert_eq!(recorded[0].channel(), Some("lead_not_found"));
}

#[tokio::test]
async fn test_request_without_subject_is_invalid() {
    let store = store();
    let request = AutomationRequest {
        event: AutomationEvent::BookingWon,
        lead_id: None,
        booking_id: None,
        payload: json!({}),
    };
    let outcome = dispatcher(&store).dispatch(request).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Skipped {
            reason: SkipReason::InvalidPayload
        }
    );
    assert_eq!(store.failures()[0].channel(), Some("invalid_payload"));
}

#[tokio::test]
async fn test_booking_event_resolves_lead_through_booking() {
    let store = store();
    let now = Utc::now();
    store.insert_booking(Booking {
        id: "bk_1".into(),
        lead_id: Some("ld_1".into()),
        lifecycle_status: LifecycleStatus::PaymentConfirmed,
        payment_status: BookingPaymentStatus::Paid,
        gross_amount: 5000.0,
        paid_amount: 5000.0,
        due_amount: 0.0,
        refund_amount: 0.0,
        currency: "INR".into(),
        created_at: now,
        updated_at: now,
    });
    let messaging = FakeMessaging::new(Behaviour::Succeed);

    let outcome = dispatcher(&store)
        .with_messaging(messaging.clone())
        .dispatch(AutomationRequest::for_booking(AutomationEvent::BookingWon, "bk_1"))
        .await
        .unwrap();

    let DispatchOutcome::Completed {
        dedup_key, channels, ..
    } = outcome
    else {
        panic!("expected completed dispatch");
    };
    assert_eq!(dedup_key, "crm_auto:booking.won:ld_1:bk_1");
    assert_eq!(messaging.sent()[0].template, "booking_confirmed");
    assert_eq!(channels[2].event(), Some("follow_up_task_not_needed"));
}

#[tokio::test]
async fn test_missing_task_store_degrades_to_suggestion() {
    let store = Arc::new(MemoryStore::new().without_collection(TASK_COLLECTION));
    store.insert_lead(lead());

    let outcome = dispatcher(&store)
        .dispatch(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1"))
        .await
        .unwrap();

    let DispatchOutcome::Completed {
        failures, channels, ..
    } = outcome
    else {
        panic!("expected completed dispatch");
    };
    assert_eq!(failures, 0);
    assert_eq!(channels[2].event(), Some("task_suggested"));
}

#[tokio::test]
async fn test_stage_change_uses_new_stage_for_template() {
    let store = store();
    let messaging = FakeMessaging::new(Behaviour::Succeed);
    let dispatcher = dispatcher(&store).with_messaging(messaging.clone());

    let outcome = dispatcher
        .dispatch(
            AutomationRequest::for_lead(AutomationEvent::LeadStageChanged, "ld_1")
                .with_payload(json!({"stage": "qualified"})),
        )
        .await
        .unwrap();
    let unknown_stage = dispatcher
        .dispatch(
            AutomationRequest::for_lead(AutomationEvent::LeadStageChanged, "ld_1")
                .with_payload(json!({"stage": "lost"})),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, DispatchOutcome::Completed { .. }));
    assert_eq!(messaging.sent().len(), 1);
    assert_eq!(messaging.sent()[0].template, "lead_qualified");
    let DispatchOutcome::Completed { channels, .. } = unknown_stage else {
        panic!("expected completed dispatch");
    };
    assert_eq!(channels[0].event(), Some("messaging_skipped_no_template"));
}

#[tokio::test]
async fn test_reservation_error_propagates() {
    let store = store();
    store.fail_next(
        "find_recent:automation_dedup",
        StoreError::Unavailable("timeout".into()),
    );
    let dispatcher = dispatcher(&store);

    let err = dispatcher
        .dispatch(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Reservation(_)));

    store.fail_next(
        "find_recent:automation_dedup",
        StoreError::Unavailable("timeout".into()),
    );
    let swallowed = dispatcher
        .dispatch_best_effort(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1"))
        .await;
    assert!(swallowed.is_none());
}

#[tokio::test]
async fn test_retry_reruns_only_failed_channel() {
    let store = store();
    let contacts = FakeContactSync::new(Behaviour::Succeed);
    dispatcher(&store)
        .with_messaging(FakeMessaging::new(Behaviour::Reject))
        .with_contact_sync(contacts.clone())
        .dispatch(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1"))
        .await
        .unwrap();
    let failure = store.failures().remove(0);

    let messaging = FakeMessaging::new(Behaviour::Succeed);
    let report = dispatcher(&store)
        .with_messaging(messaging.clone())
        .with_contact_sync(contacts.clone())
        .retry_failure(&failure)
        .await
        .unwrap();

    assert_eq!(report.channel, AutomationChannel::Messaging);
    assert!(!report.is_failure());
    assert_eq!(messaging.sent().len(), 1);
    assert_eq!(contacts.upserts().len(), 1);
}

#[tokio::test]
async fn test_lifecycle_failures_are_not_retried_here() {
    let store = store();
    let failure = store
        .record_failure(NewAutomationFailure {
            booking_id: Some("bk_1".into()),
            event: "webhook:evt_1".into(),
            error_message: "storage unavailable".into(),
            payload: json!({}),
            meta: json!({"channel": "lifecycle"}),
        })
        .await
        .unwrap();

    let err = dispatcher(&store).retry_failure(&failure).await.unwrap_err();
    assert_eq!(err, DispatchError::NotRetryable(failure.id.clone()));
}

//! Retry sweep over recorded automation failures.
//!
//! Only the side-effect channels are re-run. Each failure waits out its
//! backoff slot before the next attempt and is left for operators once it
//! reaches the attempt cap. Both filters run in the store query so rows the
//! sweep will never touch cannot crowd a batch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};
use tripdesk_core::crm::{ChannelOutcome, Dispatcher};
use tripdesk_core::error::StoreError;
use tripdesk_core::store::FailureStore;
use tripdesk_core::types::{AutomationChannel, AutomationFailure};

pub fn retry_policy(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::from_secs(0),
        1 => Duration::from_secs(60),
        2 => Duration::from_secs(300),
        3 => Duration::from_secs(1800),
        4 => Duration::from_secs(7200),
        _ => Duration::from_secs(21600),
    }
}

/// True once the failure's backoff slot has elapsed.
pub fn is_due(failure: &AutomationFailure, now: DateTime<Utc>) -> bool {
    let attempts = u32::try_from(failure.attempts).unwrap_or(0);
    let delay = chrono::Duration::from_std(retry_policy(attempts)).unwrap_or(chrono::Duration::zero());
    let last = failure.last_attempt_at.unwrap_or(failure.created_at);
    now >= last + delay
}

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub batch_size: i64,
    pub max_attempts: i32,
    pub concurrency: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub not_due: usize,
    pub resolved: usize,
    pub failed: usize,
}

enum Attempt {
    Resolved,
    Failed,
}

pub async fn sweep(
    dispatcher: &Dispatcher,
    failures: &dyn FailureStore,
    config: SweepConfig,
    now: DateTime<Utc>,
) -> Result<SweepReport, StoreError> {
    let batch = failures
        .list_retryable(
            &AutomationChannel::RETRYABLE,
            config.max_attempts,
            config.batch_size,
        )
        .await?;
    let mut report = SweepReport {
        scanned: batch.len(),
        ..SweepReport::default()
    };

    let mut due = Vec::new();
    for failure in batch {
        if !is_due(&failure, now) {
            report.not_due += 1;
        } else {
            due.push(failure);
        }
    }

    let attempts: Vec<Attempt> = stream::iter(due)
        .map(|failure| retry_one(dispatcher, failures, failure, now))
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;
    for attempt in attempts {
        match attempt {
            Attempt::Resolved => report.resolved += 1,
            Attempt::Failed => report.failed += 1,
        }
    }

    info!(
        event = "automation_retry_sweep",
        scanned = report.scanned,
        resolved = report.resolved,
        failed = report.failed,
        not_due = report.not_due,
        "retry sweep finished"
    );
    Ok(report)
}

async fn retry_one(
    dispatcher: &Dispatcher,
    failures: &dyn FailureStore,
    failure: AutomationFailure,
    now: DateTime<Utc>,
) -> Attempt {
    let error_message = match dispatcher.retry_failure(&failure).await {
        Ok(report) => match report.outcome {
            ChannelOutcome::Succeeded { .. } | ChannelOutcome::Skipped { .. } => {
                return match failures.resolve(&failure.id, now).await {
                    Ok(_) => Attempt::Resolved,
                    Err(err) => {
                        warn!(failure_id = %failure.id, error = %err, "could not resolve automation failure");
                        Attempt::Failed
                    }
                };
            }
            ChannelOutcome::Failed { error } => error,
        },
        Err(err) => err.to_string(),
    };

    if let Err(err) = failures.mark_attempt(&failure.id, &error_message, now).await {
        warn!(failure_id = %failure.id, error = %err, "could not record retry attempt");
    }
    warn!(
        event = "automation_retry_failed",
        failure_id = %failure.id,
        attempts = failure.attempts + 1,
        error = %error_message,
        "automation retry failed"
    );
    Attempt::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tripdesk_core::crm::{MessagingProvider, TemplateMessage};
    use tripdesk_core::error::ChannelError;
    use tripdesk_core::store::MemoryStore;
    use tripdesk_core::types::{Lead, NewAutomationFailure};

    struct RejectingMessaging;

    #[async_trait]
    impl MessagingProvider for RejectingMessaging {
        async fn send_template(&self, _message: &TemplateMessage) -> Result<(), ChannelError> {
            Err(ChannelError::Rejected {
                status: 503,
                body: "upstream down".into(),
            })
        }
    }

    struct AcceptingMessaging;

    #[async_trait]
    impl MessagingProvider for AcceptingMessaging {
        async fn send_template(&self, _message: &TemplateMessage) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    const CONFIG: SweepConfig = SweepConfig {
        batch_size: 50,
        max_attempts: 3,
        concurrency: 2,
    };

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_lead(Lead {
            id: "ld_1".into(),
            name: "Asha".into(),
            email: Some("asha@example.com".into()),
            phone: Some("+919800000000".into()),
            stage: Some("new".into()),
        });
        store
    }

    fn dispatcher(store: &Arc<MemoryStore>, messaging: Arc<dyn MessagingProvider>) -> Dispatcher {
        Dispatcher::new(store.clone(), store.clone(), store.clone(), store.clone())
            .with_messaging(messaging)
    }

    async fn record(store: &MemoryStore, channel: &str) -> AutomationFailure {
        record_for(store, channel, "ld_1").await
    }

    async fn record_for(store: &MemoryStore, channel: &str, lead_id: &str) -> AutomationFailure {
        store
            .record_failure(NewAutomationFailure {
                booking_id: None,
                event: format!("crm_auto:lead.created:{lead_id}:created"),
                error_message: "provider timed out after 8s".into(),
                payload: json!({
                    "event": "lead.created",
                    "lead_id": lead_id,
                    "booking_id": null,
                    "payload": {},
                }),
                meta: json!({
                    "channel": channel,
                    "dedup_key": format!("crm_auto:lead.created:{lead_id}:created"),
                }),
            })
            .await
            .unwrap()
    }

    fn failure_at(attempts: i32, last: Option<DateTime<Utc>>, created: DateTime<Utc>) -> AutomationFailure {
        AutomationFailure {
            id: "af_1".into(),
            booking_id: None,
            event: "k".into(),
            error_message: "x".into(),
            payload: json!({}),
            meta: json!({"channel": "messaging"}),
            attempts,
            last_attempt_at: last,
            resolved_at: None,
            created_at: created,
        }
    }

    #[test]
    fn test_retry_policy_schedule() {
        assert_eq!(retry_policy(0), Duration::from_secs(0));
        assert_eq!(retry_policy(1), Duration::from_secs(60));
        assert_eq!(retry_policy(4), Duration::from_secs(7200));
        assert_eq!(retry_policy(9), Duration::from_secs(21600));
    }

    #[test]
    fn test_is_due_follows_last_attempt() {
        let now = Utc::now();
        assert!(is_due(&failure_at(0, None, now), now));

        let last = now - chrono::Duration::seconds(30);
        assert!(!is_due(&failure_at(1, Some(last), last), now));
        assert!(is_due(&failure_at(1, Some(last), last), now + chrono::Duration::seconds(31)));
    }

    #[tokio::test]
    async fn test_successful_retry_resolves() {
        let store = store();
        let failure = record(&store, "messaging").await;
        let dispatcher = dispatcher(&store, Arc::new(AcceptingMessaging));

        let report = sweep(&dispatcher, store.as_ref(), CONFIG, Utc::now()).await.unwrap();

        assert_eq!(report.resolved, 1);
        assert!(store.get_failure(&failure.id).await.unwrap().unwrap().resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_retry_counts_attempt_and_backs_off() {
        let store = store();
        let failure = record(&store, "messaging").await;
        let dispatcher = dispatcher(&store, Arc::new(RejectingMessaging));
        let now = Utc::now();

        let report = sweep(&dispatcher, store.as_ref(), CONFIG, now).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = store.get_failure(&failure.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.resolved_at.is_none());
        assert!(stored.error_message.contains("upstream down"));
        // no new failure row for the retried channel
        assert_eq!(store.failures().len(), 1);

        let report = sweep(&dispatcher, store.as_ref(), CONFIG, now).await.unwrap();
        assert_eq!(report.not_due, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_channels_are_left_alone() {
        let store = store();
        let failure = record(&store, "lifecycle").await;
        record(&store, "lead_not_found").await;
        let dispatcher = dispatcher(&store, Arc::new(AcceptingMessaging));

        let report = sweep(&dispatcher, store.as_ref(), CONFIG, Utc::now()).await.unwrap();

        assert_eq!(report.scanned, 0);
        assert_eq!(report.resolved, 0);
        let stored = store.get_failure(&failure.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_capped_failures_wait_for_operators() {
        let store = store();
        let failure = record(&store, "messaging").await;
        for _ in 0..CONFIG.max_attempts {
            store.mark_attempt(&failure.id, "still down", Utc::now()).await.unwrap();
        }
        let dispatcher = dispatcher(&store, Arc::new(AcceptingMessaging));

        let report = sweep(&dispatcher, store.as_ref(), CONFIG, Utc::now()).await.unwrap();

        assert_eq!(report.scanned, 0);
        assert!(store.get_failure(&failure.id).await.unwrap().unwrap().resolved_at.is_none());
    }

    #[tokio::test]
    async fn test_unretryable_backlog_does_not_starve_batch() {
        let store = store();
        for n in 0..5 {
            record_for(&store, "lead_not_found", &format!("ld_missing_{n}")).await;
        }
        let capped = record(&store, "contact_sync").await;
        for _ in 0..CONFIG.max_attempts {
            store.mark_attempt(&capped.id, "still down", Utc::now()).await.unwrap();
        }
        let task = record(&store, "follow_up_task").await;
        let dispatcher = dispatcher(&store, Arc::new(AcceptingMessaging));
        let config = SweepConfig {
            batch_size: 5,
            ..CONFIG
        };

        let report = sweep(&dispatcher, store.as_ref(), config, Utc::now()).await.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.resolved, 1);
        let stored = store.get_failure(&task.id).await.unwrap().unwrap();
        assert!(stored.resolved_at.is_some());
    }
}

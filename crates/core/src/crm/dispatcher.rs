use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::channels::{
    contact_tags, follow_up_plan, template_for, template_message, with_timeout,
    write_follow_up_task, ContactSyncProvider, ContactUpsert, FollowUpTask, HttpContactSyncClient,
    HttpMessagingClient, MessagingProvider,
};
use super::{
    dedup_key, scope_value, AutomationRequest, ChannelOutcome, ChannelReport, DispatchOutcome,
    SkipReason,
};
use crate::config::Settings;
use crate::dedup::{DedupReserver, ReserveRequest, DEFAULT_WINDOW_DAYS};
use crate::error::{ChannelError, DispatchError, StoreError};
use crate::store::{BookingStore, FailureStore, LeadStore, RecordStore};
use crate::types::{AutomationChannel, AutomationEvent, AutomationFailure, Lead, NewAutomationFailure};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(8);

/// Everything a channel needs, resolved once per dispatch.
struct RunContext {
    event: AutomationEvent,
    lead: Lead,
    booking_id: Option<String>,
    payload: Value,
    dedup_key: String,
    stage: Option<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    leads: Arc<dyn LeadStore>,
    bookings: Arc<dyn BookingStore>,
    failures: Arc<dyn FailureStore>,
    records: Arc<dyn RecordStore>,
    reserver: DedupReserver,
    messaging: Option<Arc<dyn MessagingProvider>>,
    contact_sync: Option<Arc<dyn ContactSyncProvider>>,
    timeout: Duration,
    window_days: i64,
}

impl Dispatcher {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        bookings: Arc<dyn BookingStore>,
        failures: Arc<dyn FailureStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            reserver: DedupReserver::new(records.clone()),
            leads,
            bookings,
            failures,
            records,
            messaging: None,
            contact_sync: None,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }

    pub fn with_messaging(mut self, provider: Arc<dyn MessagingProvider>) -> Self {
        self.messaging = Some(provider);
        self
    }

    pub fn with_contact_sync(mut self, provider: Arc<dyn ContactSyncProvider>) -> Self {
        self.contact_sync = Some(provider);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_window_days(mut self, window_days: i64) -> Self {
        self.window_days = window_days;
        self
    }

    /// Applies provider credentials, timeout and dedup window from settings.
    pub fn with_settings(mut self, settings: &Settings, client: &reqwest::Client) -> Self {
        if let Some(config) = &settings.messaging {
            self = self.with_messaging(Arc::new(HttpMessagingClient::new(
                client.clone(),
                config.clone(),
            )));
        }
        if let Some(config) = &settings.contact_sync {
            self = self.with_contact_sync(Arc::new(HttpContactSyncClient::new(
                client.clone(),
                config.clone(),
            )));
        }
        self.with_timeout(Duration::from_secs(settings.provider_timeout_secs))
            .with_window_days(settings.dedup_window_days)
    }

    pub async fn dispatch(
        &self,
        request: AutomationRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let lead = match self.resolve_lead(&request).await? {
            Ok(lead) => lead,
            Err(reason) => {
                self.record_skip(&request, reason).await;
                return Ok(DispatchOutcome::Skipped { reason });
            }
        };

        let scope = scope_value(
            request.event,
            &request.payload,
            &lead,
            request.booking_id.as_deref(),
        );
        let key = dedup_key(request.event, &lead.id, &scope);
        let reservation = self
            .reserver
            .reserve(
                &ReserveRequest::new(&key, request.event.as_str(), &lead.id, &scope)
                    .with_window_days(self.window_days),
            )
            .await
            .map_err(DispatchError::Reservation)?;
        if !reservation.should_run {
            info!(
                event = "crm_automation_deduped",
                dedup_key = %key,
                reason = ?reservation.reason,
                "automation already ran within window"
            );
            return Ok(DispatchOutcome::Deduped { dedup_key: key });
        }

        let stage = match request.event {
            AutomationEvent::LeadStageChanged => Some(scope.clone()),
            _ => lead.stage.clone(),
        };
        let ctx = RunContext {
            event: request.event,
            lead,
            booking_id: request.booking_id.clone(),
            payload: request.payload.clone(),
            dedup_key: key.clone(),
            stage,
        };

        let (messaging, contact_sync, follow_up) = tokio::join!(
            self.run_messaging(&ctx),
            self.run_contact_sync(&ctx),
            self.run_follow_up_task(&ctx),
        );
        let channels = vec![messaging, contact_sync, follow_up];

        let mut failures = 0;
        for report in &channels {
            if let ChannelOutcome::Failed { error } = &report.outcome {
                failures += 1;
                self.record_channel_failure(&ctx, report.channel, error).await;
            }
        }

        if failures == 0 {
            info!(
                event = "crm_automation_completed",
                dedup_key = %key,
                lead_id = %ctx.lead.id,
                "crm automation completed"
            );
        } else {
            warn!(
                event = "crm_automation_completed_with_failures",
                dedup_key = %key,
                lead_id = %ctx.lead.id,
                failures,
                "crm automation completed with failures"
            );
        }

        Ok(DispatchOutcome::Completed {
            dedup_key: key,
            failures,
            channels,
        })
    }

    /// Dispatch that never fails the caller.
    pub async fn dispatch_best_effort(&self, request: AutomationRequest) -> Option<DispatchOutcome> {
        let event = request.event;
        match self.dispatch(request).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(
                    event = "crm_automation_error",
                    automation_event = %event,
                    error = %err,
                    "crm automation failed"
                );
                None
            }
        }
    }

    /// Re-runs the single channel a failure was recorded for, from its
    /// stored snapshot. The failure row stands in for the dedup slot.
    pub async fn retry_failure(
        &self,
        failure: &AutomationFailure,
    ) -> Result<ChannelReport, DispatchError> {
        let channel = failure
            .automation_channel()
            .filter(AutomationChannel::is_retryable)
            .ok_or_else(|| DispatchError::NotRetryable(failure.id.clone()))?;
        let event = failure
            .payload
            .get("event")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<AutomationEvent>().ok())
            .ok_or_else(|| DispatchError::NotRetryable(failure.id.clone()))?;
        let lead_id = failure
            .payload
            .get("lead_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::NotRetryable(failure.id.clone()))?;

        let Some(lead) = self
            .leads
            .get_lead(lead_id)
            .await
            .map_err(DispatchError::Lookup)?
        else {
            return Ok(ChannelReport {
                channel,
                outcome: ChannelOutcome::Failed {
                    error: format!("lead {lead_id} not found"),
                },
            });
        };

        let payload = failure.payload.get("payload").cloned().unwrap_or(Value::Null);
        let booking_id = failure
            .payload
            .get("booking_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let stage = match event {
            AutomationEvent::LeadStageChanged => {
                Some(scope_value(event, &payload, &lead, booking_id.as_deref()))
            }
            _ => lead.stage.clone(),
        };
        let ctx = RunContext {
            event,
            lead,
            booking_id,
            payload,
            dedup_key: failure
                .meta
                .get("dedup_key")
                .and_then(Value::as_str)
                .unwrap_or(failure.event.as_str())
                .to_string(),
            stage,
        };

        let report = match channel {
            AutomationChannel::Messaging => self.run_messaging(&ctx).await,
            AutomationChannel::ContactSync => self.run_contact_sync(&ctx).await,
            _ => self.run_follow_up_task(&ctx).await,
        };
        info!(
            failure_id = %failure.id,
            channel = %channel,
            failed = report.is_failure(),
            "automation channel retried"
        );
        Ok(report)
    }

    async fn resolve_lead(
        &self,
        request: &AutomationRequest,
    ) -> Result<Result<Lead, SkipReason>, DispatchError> {
        let lead_id = match (&request.lead_id, &request.booking_id) {
            (Some(lead_id), _) if !lead_id.trim().is_empty() => lead_id.clone(),
            (_, Some(booking_id)) if !booking_id.trim().is_empty() => {
                let booking = self
                    .bookings
                    .get_booking(booking_id)
                    .await
                    .map_err(DispatchError::Lookup)?;
                match booking.and_then(|b| b.lead_id) {
                    Some(lead_id) => lead_id,
                    None => return Ok(Err(SkipReason::LeadNotFound)),
                }
            }
            _ => return Ok(Err(SkipReason::InvalidPayload)),
        };

        match self
            .leads
            .get_lead(&lead_id)
            .await
            .map_err(DispatchError::Lookup)?
        {
            Some(lead) => Ok(Ok(lead)),
            None => Ok(Err(SkipReason::LeadNotFound)),
        }
    }

    async fn run_messaging(&self, ctx: &RunContext) -> ChannelReport {
        let report = |outcome| ChannelReport {
            channel: AutomationChannel::Messaging,
            outcome,
        };
        let Some(provider) = &self.messaging else {
            info!(event = "messaging_skipped_missing_config", dedup_key = %ctx.dedup_key, "messaging provider not configured");
            return report(ChannelOutcome::Skipped {
                event: "messaging_skipped_missing_config",
            });
        };
        let Some(phone) = ctx.lead.phone.as_deref().filter(|p| !p.trim().is_empty()) else {
            info!(event = "messaging_skipped_no_phone", lead_id = %ctx.lead.id, "lead has no phone number");
            return report(ChannelOutcome::Skipped {
                event: "messaging_skipped_no_phone",
            });
        };
        let Some(template) = template_for(ctx.event, ctx.stage.as_deref()) else {
            info!(event = "messaging_skipped_no_template", automation_event = %ctx.event, "no template for event");
            return report(ChannelOutcome::Skipped {
                event: "messaging_skipped_no_template",
            });
        };

        let message = template_message(template, phone, &ctx.lead, &ctx.payload);
        match with_timeout(self.timeout, provider.send_template(&message)).await {
            Ok(()) => {
                info!(event = "messaging_sent", template, lead_id = %ctx.lead.id, "template message sent");
                report(ChannelOutcome::Succeeded {
                    event: "messaging_sent",
                })
            }
            Err(err) => report(ChannelOutcome::Failed {
                error: err.to_string(),
            }),
        }
    }

    async fn run_contact_sync(&self, ctx: &RunContext) -> ChannelReport {
        let report = |outcome| ChannelReport {
            channel: AutomationChannel::ContactSync,
            outcome,
        };
        let Some(provider) = &self.contact_sync else {
            info!(event = "contact_sync_skipped_missing_config", dedup_key = %ctx.dedup_key, "contact sync not configured");
            return report(ChannelOutcome::Skipped {
                event: "contact_sync_skipped_missing_config",
            });
        };
        let Some(email) = ctx.lead.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            info!(event = "contact_sync_skipped_no_email", lead_id = %ctx.lead.id, "lead has no email");
            return report(ChannelOutcome::Skipped {
                event: "contact_sync_skipped_no_email",
            });
        };

        let contact = ContactUpsert {
            email: email.to_string(),
            name: ctx.lead.name.clone(),
            phone: ctx.lead.phone.clone(),
            tags: contact_tags(ctx.event, ctx.stage.as_deref()),
            list_id: None,
        };
        match with_timeout(self.timeout, provider.upsert_contact(&contact)).await {
            Ok(()) => {
                info!(event = "contact_sync_upsert_success", lead_id = %ctx.lead.id, "contact upserted");
                report(ChannelOutcome::Succeeded {
                    event: "contact_sync_upsert_success",
                })
            }
            Err(err) => report(ChannelOutcome::Failed {
                error: err.to_string(),
            }),
        }
    }

    async fn run_follow_up_task(&self, ctx: &RunContext) -> ChannelReport {
        let report = |outcome| ChannelReport {
            channel: AutomationChannel::FollowUpTask,
            outcome,
        };
        let Some((delay, title)) = follow_up_plan(ctx.event) else {
            return report(ChannelOutcome::Skipped {
                event: "follow_up_task_not_needed",
            });
        };

        let now = Utc::now();
        let task = FollowUpTask {
            lead_id: ctx.lead.id.clone(),
            booking_id: ctx.booking_id.clone(),
            title: title.to_string(),
            due_at: now + delay,
            dedup_key: ctx.dedup_key.clone(),
        };
        match write_follow_up_task(self.records.as_ref(), &task, now).await {
            Ok(shape) => {
                info!(event = "follow_up_task_created", lead_id = %task.lead_id, shape, due_at = %task.due_at, "follow-up task created");
                report(ChannelOutcome::Succeeded {
                    event: "follow_up_task_created",
                })
            }
            Err(ChannelError::Store(StoreError::UndefinedCollection(_))) => {
                info!(
                    event = "task_suggested",
                    lead_id = %task.lead_id,
                    title = %task.title,
                    due_at = %task.due_at,
                    "no task store, follow-up suggested"
                );
                report(ChannelOutcome::Skipped {
                    event: "task_suggested",
                })
            }
            // the task already exists for this dispatch
            Err(ChannelError::Store(err)) if err.is_unique_violation() => {
                report(ChannelOutcome::Succeeded {
                    event: "follow_up_task_exists",
                })
            }
            Err(err) => report(ChannelOutcome::Failed {
                error: err.to_string(),
            }),
        }
    }

    async fn record_skip(&self, request: &AutomationRequest, reason: SkipReason) {
        let channel = reason.channel();
        let subject = request
            .lead_id
            .as_deref()
            .or(request.booking_id.as_deref())
            .unwrap_or("unknown");
        warn!(
            event = "crm_automation_skipped",
            automation_event = %request.event,
            reason = %channel,
            subject,
            "crm automation skipped"
        );
        let failure = NewAutomationFailure {
            booking_id: request.booking_id.clone(),
            event: format!("crm_auto:{}:{}", request.event.as_str(), subject),
            error_message: channel.as_str().to_string(),
            payload: json!({
                "event": request.event,
                "lead_id": request.lead_id,
                "booking_id": request.booking_id,
                "payload": request.payload,
            }),
            meta: json!({ "channel": channel }),
        };
        if let Err(err) = self.failures.record_failure(failure).await {
            error!(error = %err, "could not record skipped automation");
        }
    }

    async fn record_channel_failure(
        &self,
        ctx: &RunContext,
        channel: AutomationChannel,
        error_message: &str,
    ) {
        warn!(
            event = "crm_channel_failed",
            channel = %channel,
            dedup_key = %ctx.dedup_key,
            error = %error_message,
            "automation channel failed"
        );
        let failure = NewAutomationFailure {
            booking_id: ctx.booking_id.clone(),
            event: ctx.dedup_key.clone(),
            error_message: error_message.to_string(),
            payload: json!({
                "event": ctx.event,
                "lead_id": ctx.lead.id,
                "booking_id": ctx.booking_id,
                "payload": ctx.payload,
            }),
            meta: json!({ "channel": channel, "dedup_key": ctx.dedup_key }),
        };
        if let Err(err) = self.failures.record_failure(failure).await {
            error!(error = %err, dedup_key = %ctx.dedup_key, "could not record automation failure");
        }
    }
}

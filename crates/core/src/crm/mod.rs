//! CRM automation dispatch.
//!
//! A domain event reserves a dedup slot for `(event, lead, scope)` and then
//! fans out to messaging, contact sync and follow-up task creation. Each
//! channel fails on its own; failures become automation failure records and
//! never undo what the other channels already did.

pub mod channels;
mod dispatcher;
pub mod queue;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AutomationChannel, AutomationEvent, Lead};

pub use channels::{
    ContactSyncProvider, ContactUpsert, HttpContactSyncClient, HttpMessagingClient,
    MessagingProvider, TemplateMessage,
};
pub use dispatcher::Dispatcher;
pub use queue::AutomationQueue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRequest {
    pub event: AutomationEvent,
    #[serde(default, alias = "lead_id")]
    pub lead_id: Option<String>,
    #[serde(default, alias = "booking_id")]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl AutomationRequest {
    pub fn for_lead(event: AutomationEvent, lead_id: impl Into<String>) -> Self {
        Self {
            event,
            lead_id: Some(lead_id.into()),
            booking_id: None,
            payload: Value::Null,
        }
    }

    pub fn for_booking(event: AutomationEvent, booking_id: impl Into<String>) -> Self {
        Self {
            event,
            lead_id: None,
            booking_id: Some(booking_id.into()),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LeadNotFound,
    InvalidPayload,
}

impl SkipReason {
    pub fn channel(&self) -> AutomationChannel {
        match self {
            SkipReason::LeadNotFound => AutomationChannel::LeadNotFound,
            SkipReason::InvalidPayload => AutomationChannel::InvalidPayload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Succeeded { event: &'static str },
    Skipped { event: &'static str },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    pub channel: AutomationChannel,
    #[serde(flatten)]
    pub outcome: ChannelOutcome,
}

impl ChannelReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, ChannelOutcome::Failed { .. })
    }

    /// Log event name for successes and skips.
    pub fn event(&self) -> Option<&'static str> {
        match self.outcome {
            ChannelOutcome::Succeeded { event } | ChannelOutcome::Skipped { event } => Some(event),
            ChannelOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Skipped {
        reason: SkipReason,
    },
    Deduped {
        dedup_key: String,
    },
    Completed {
        dedup_key: String,
        failures: usize,
        channels: Vec<ChannelReport>,
    },
}

/// Value that distinguishes repeated occurrences of an event for one lead.
pub fn scope_value(
    event: AutomationEvent,
    payload: &Value,
    lead: &Lead,
    booking_id: Option<&str>,
) -> String {
    let text = |key: &str| {
        payload.get(key).and_then(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    let booking = || booking_id.unwrap_or("none").to_string();

    match event {
        AutomationEvent::LeadCreated => "created".to_string(),
        AutomationEvent::LeadStageChanged => text("stage")
            .or_else(|| text("to_stage"))
            .or_else(|| lead.stage.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        AutomationEvent::QuoteSent => text("quote_id").unwrap_or_else(booking),
        AutomationEvent::BookingWon => booking(),
        AutomationEvent::PaymentLinkCreated => format!(
            "{}:{}",
            booking(),
            text("amount").unwrap_or_else(|| "0".to_string())
        ),
    }
}

pub fn dedup_key(event: AutomationEvent, lead_id: &str, scope_value: &str) -> String {
    format!("crm_auto:{}:{}:{}", event.as_str(), lead_id, scope_value)
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod scope_tests {
    use super::*;
    use serde_json::json;

    fn lead(stage: Option<&str>) -> Lead {
        Lead {
            id: "ld_1".into(),
            name: "Asha".into(),
            email: None,
            phone: None,
            stage: stage.map(str::to_string),
        }
    }

    #[test]
    fn test_scope_values() {
        let lead = lead(Some("contacted"));
        assert_eq!(
            scope_value(AutomationEvent::LeadCreated, &json!({}), &lead, None),
            "created"
        );
        assert_eq!(
            scope_value(AutomationEvent::LeadStageChanged, &json!({"stage": "qualified"}), &lead, None),
            "qualified"
        );
        assert_eq!(
            scope_value(AutomationEvent::LeadStageChanged, &json!({"to_stage": "proposal"}), &lead, None),
            "proposal"
        );
        assert_eq!(
            scope_value(AutomationEvent::LeadStageChanged, &Value::Null, &lead, None),
            "contacted"
        );
        assert_eq!(
            scope_value(AutomationEvent::QuoteSent, &json!({"quote_id": "q_9"}), &lead, Some("bk_1")),
            "q_9"
        );
        assert_eq!(
            scope_value(AutomationEvent::QuoteSent, &json!({}), &lead, Some("bk_1")),
            "bk_1"
        );
        assert_eq!(
            scope_value(AutomationEvent::BookingWon, &json!({}), &lead, Some("bk_1")),
            "bk_1"
        );
        assert_eq!(
            scope_value(AutomationEvent::PaymentLinkCreated, &json!({"amount": 5000}), &lead, Some("bk_1")),
            "bk_1:5000"
        );
    }

    #[test]
    fn test_dedup_key_format() {
        assert_eq!(
            dedup_key(AutomationEvent::LeadCreated, "ld_1", "created"),
            "crm_auto:lead.created:ld_1:created"
        );
    }

    #[test]
    fn test_request_accepts_camel_and_snake_case() {
        let camel: AutomationRequest =
            serde_json::from_value(json!({"event": "quote.sent", "leadId": "ld_1"})).unwrap();
        let snake: AutomationRequest =
            serde_json::from_value(json!({"event": "quote.sent", "lead_id": "ld_1"})).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.payload, Value::Null);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raised when a stored string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: value.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    BookingCreated,
    PaymentPending,
    PaymentConfirmed,
    Fulfilled,
    Completed,
    Cancelled,
    Refunded,
}

string_enum!(LifecycleStatus, "lifecycle status", {
    BookingCreated => "booking_created",
    PaymentPending => "payment_pending",
    PaymentConfirmed => "payment_confirmed",
    Fulfilled => "fulfilled",
    Completed => "completed",
    Cancelled => "cancelled",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingPaymentStatus {
    Unpaid,
    Pending,
    Paid,
    Refunded,
}

string_enum!(BookingPaymentStatus, "booking payment status", {
    Unpaid => "unpaid",
    Pending => "pending",
    Paid => "paid",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Razorpay,
    Stripe,
    Manual,
}

string_enum!(PaymentProvider, "payment provider", {
    Razorpay => "razorpay",
    Stripe => "stripe",
    Manual => "manual",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    RequiresAction,
    Authorized,
    Captured,
    Failed,
    Refunded,
}

string_enum!(PaymentStatus, "payment status", {
    RequiresAction => "requires_action",
    Authorized => "authorized",
    Captured => "captured",
    Failed => "failed",
    Refunded => "refunded",
});

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::RequiresAction,
        PaymentStatus::Failed,
        PaymentStatus::Authorized,
        PaymentStatus::Captured,
        PaymentStatus::Refunded,
    ];

    /// Position in the forward order a payment moves through.
    pub fn rank(&self) -> u8 {
        match self {
            PaymentStatus::RequiresAction => 0,
            PaymentStatus::Failed => 1,
            PaymentStatus::Authorized => 2,
            PaymentStatus::Captured => 3,
            PaymentStatus::Refunded => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    Webhook,
    Human,
}

string_enum!(ActorType, "actor type", {
    System => "system",
    Webhook => "webhook",
    Human => "human",
});

/// Domain events the CRM automation dispatcher reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AutomationEvent {
    #[serde(rename = "lead.created")]
    LeadCreated,
    #[serde(rename = "lead.stage_changed")]
    LeadStageChanged,
    #[serde(rename = "quote.sent")]
    QuoteSent,
    #[serde(rename = "booking.won")]
    BookingWon,
    #[serde(rename = "payment.link_created")]
    PaymentLinkCreated,
}

string_enum!(AutomationEvent, "automation event", {
    LeadCreated => "lead.created",
    LeadStageChanged => "lead.stage_changed",
    QuoteSent => "quote.sent",
    BookingWon => "booking.won",
    PaymentLinkCreated => "payment.link_created",
});

/// Side channel an automation failure belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutomationChannel {
    Messaging,
    ContactSync,
    FollowUpTask,
    Lifecycle,
    LeadNotFound,
    InvalidPayload,
}

string_enum!(AutomationChannel, "automation channel", {
    Messaging => "messaging",
    ContactSync => "contact_sync",
    FollowUpTask => "follow_up_task",
    Lifecycle => "lifecycle",
    LeadNotFound => "lead_not_found",
    InvalidPayload => "invalid_payload",
});

impl AutomationChannel {
    pub const RETRYABLE: [AutomationChannel; 3] = [
        AutomationChannel::Messaging,
        AutomationChannel::ContactSync,
        AutomationChannel::FollowUpTask,
    ];

    /// Channels the retry sweep may re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AutomationChannel::Messaging
                | AutomationChannel::ContactSync
                | AutomationChannel::FollowUpTask
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: String,
    pub lead_id: Option<String>,
    pub lifecycle_status: LifecycleStatus,
    pub payment_status: BookingPaymentStatus,
    pub gross_amount: f64,
    pub paid_amount: f64,
    pub due_amount: f64,
    pub refund_amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: String,
    pub booking_id: String,
    pub provider: PaymentProvider,
    pub idempotency_key: String,
    pub provider_order_id: Option<String>,
    pub provider_payment_intent_id: Option<String>,
    pub webhook_event_id: Option<String>,
    pub status: PaymentStatus,
    /// Major currency units.
    pub amount: f64,
    /// Minor currency units, as reported by the gateway.
    pub amount_captured: i64,
    pub amount_refunded: i64,
    pub currency: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// The row a webhook write leaves behind when `incoming` lands on `self`.
    ///
    /// Status only moves forward, gateway amounts never shrink and the first
    /// `paid_at` sticks, whatever order concurrent writes commit in.
    pub fn merge_webhook(&self, incoming: &Payment) -> Payment {
        let mut merged = self.clone();
        if incoming.status.rank() >= self.status.rank() {
            merged.status = incoming.status;
        }
        merged.amount_captured = self.amount_captured.max(incoming.amount_captured);
        merged.amount_refunded = self.amount_refunded.max(incoming.amount_refunded);
        merged.paid_at = self.paid_at.or(incoming.paid_at);
        merged.webhook_event_id = incoming.webhook_event_id.clone();
        merged.updated_at = incoming.updated_at;
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub id: String,
    pub booking_id: String,
    pub from_status: LifecycleStatus,
    pub to_status: LifecycleStatus,
    pub actor_type: ActorType,
    pub idempotency_key: String,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub provider: PaymentProvider,
    pub payment_id: String,
    pub status: PaymentStatus,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub stage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationFailure {
    pub id: String,
    pub booking_id: Option<String>,
    /// Dedup key of the originating dispatch, reused as correlation id.
    pub event: String,
    pub error_message: String,
    pub payload: serde_json::Value,
    pub meta: serde_json::Value,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AutomationFailure {
    pub fn channel(&self) -> Option<&str> {
        self.meta.get("channel").and_then(|value| value.as_str())
    }

    pub fn automation_channel(&self) -> Option<AutomationChannel> {
        self.channel().and_then(|raw| raw.parse().ok())
    }
}

/// Input for a new automation failure row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAutomationFailure {
    pub booking_id: Option<String>,
    pub event: String,
    pub error_message: String,
    pub payload: serde_json::Value,
    pub meta: serde_json::Value,
}

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid::nanoid!(16))
}

/// ISO 4217 minor-unit exponent for a currency code.
pub fn minor_unit_exponent(currency: &str) -> i32 {
    match currency.trim().to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "UYI" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Converts a major-unit amount into the gateway's minor units.
pub fn to_minor_units(amount: f64, currency: &str) -> i64 {
    (amount * 10f64.powi(minor_unit_exponent(currency))).round() as i64
}

pub fn from_minor_units(minor: i64, currency: &str) -> f64 {
    minor as f64 / 10f64.powi(minor_unit_exponent(currency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_status_round_trips_through_str() {
        for status in [
            LifecycleStatus::BookingCreated,
            LifecycleStatus::PaymentPending,
            LifecycleStatus::PaymentConfirmed,
            LifecycleStatus::Fulfilled,
            LifecycleStatus::Completed,
            LifecycleStatus::Cancelled,
            LifecycleStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<LifecycleStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_serde_names_match_storage_names() {
        let json = serde_json::to_string(&PaymentStatus::RequiresAction).unwrap();
        assert_eq!(json, "\"requires_action\"");
        assert_eq!(PaymentStatus::RequiresAction.as_str(), "requires_action");
    }

    #[test]
    fn test_unknown_variant_reports_kind() {
        let err = "paypal".parse::<PaymentProvider>().unwrap_err();
        assert_eq!(err.kind, "payment provider");
        assert_eq!(err.to_string(), "unknown payment provider 'paypal'");
    }

    #[test]
    fn test_to_minor_units_rounds() {
        assert_eq!(to_minor_units(5000.0, "INR"), 500000);
        assert_eq!(to_minor_units(19.99, "usd"), 1999);
        assert_eq!(to_minor_units(1200.0, "JPY"), 1200);
        assert_eq!(to_minor_units(1.5, "KWD"), 1500);
    }

    fn payment(status: PaymentStatus, captured: i64) -> Payment {
        let now = Utc::now();
        Payment {
            id: "pay_1".into(),
            booking_id: "bk_1".into(),
            provider: PaymentProvider::Razorpay,
            idempotency_key: "intent_1".into(),
            provider_order_id: Some("order_1".into()),
            provider_payment_intent_id: None,
            webhook_event_id: None,
            status,
            amount: 5000.0,
            amount_captured: captured,
            amount_refunded: 0,
            currency: "INR".into(),
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_merge_webhook_never_moves_backwards() {
        let mut stored = payment(PaymentStatus::Captured, 500000);
        stored.paid_at = Some(Utc::now());
        let mut late = payment(PaymentStatus::Authorized, 0);
        late.webhook_event_id = Some("evt_auth".into());

        let merged = stored.merge_webhook(&late);
        assert_eq!(merged.status, PaymentStatus::Captured);
        assert_eq!(merged.amount_captured, 500000);
        assert_eq!(merged.paid_at, stored.paid_at);
        assert_eq!(merged.webhook_event_id.as_deref(), Some("evt_auth"));

        let refund = payment(PaymentStatus::Refunded, 0);
        assert_eq!(stored.merge_webhook(&refund).status, PaymentStatus::Refunded);
    }

    #[test]
    fn test_from_minor_units_uses_currency_exponent() {
        assert_eq!(from_minor_units(500000, "INR"), 5000.0);
        assert_eq!(from_minor_units(1200, "JPY"), 1200.0);
        assert_eq!(from_minor_units(1500, "KWD"), 1.5);
    }

    #[test]
    fn test_new_id_has_prefix() {
        let id = new_id("pay");
        assert!(id.starts_with("pay_"));
        assert_eq!(id.len(), 4 + 16);
    }

    #[test]
    fn test_failure_channel_reads_meta() {
        let failure = AutomationFailure {
            id: "af_1".to_string(),
            booking_id: None,
            event: "crm_auto:lead.created:ld_1:created".to_string(),
            error_message: "boom".to_string(),
            payload: serde_json::json!({}),
            meta: serde_json::json!({"channel": "messaging"}),
            attempts: 0,
            last_attempt_at: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(failure.channel(), Some("messaging"));
        assert_eq!(
            failure.automation_channel(),
            Some(AutomationChannel::Messaging)
        );
    }

    #[test]
    fn test_automation_event_names() {
        let event: AutomationEvent = serde_json::from_str("\"payment.link_created\"").unwrap();
        assert_eq!(event, AutomationEvent::PaymentLinkCreated);
        assert_eq!(
            "lead.stage_changed".parse::<AutomationEvent>().unwrap(),
            AutomationEvent::LeadStageChanged
        );
        assert!(!AutomationChannel::Lifecycle.is_retryable());
        assert!(AutomationChannel::FollowUpTask.is_retryable());
    }
}

use crate::types::{LifecycleStatus, PaymentStatus};

/// Maps a gateway event type onto the internal payment status.
///
/// Total: unrecognised vocabulary lands on `RequiresAction`.
pub fn map_event_status(event_type: &str) -> PaymentStatus {
    let event = event_type.to_ascii_lowercase();
    if event.contains("captured") || event.contains("succeeded") {
        PaymentStatus::Captured
    } else if event.contains("authorized") {
        PaymentStatus::Authorized
    } else if event.contains("refund") {
        PaymentStatus::Refunded
    } else if event.contains("fail") {
        PaymentStatus::Failed
    } else {
        PaymentStatus::RequiresAction
    }
}

/// Whether moving from `current` to `next` is forward progress.
pub fn advances(current: PaymentStatus, next: PaymentStatus) -> bool {
    next.rank() > current.rank()
}

/// Lifecycle status a payment status drives the booking into, if any.
pub fn lifecycle_target(status: PaymentStatus) -> Option<LifecycleStatus> {
    match status {
        PaymentStatus::Captured => Some(LifecycleStatus::PaymentConfirmed),
        PaymentStatus::Refunded => Some(LifecycleStatus::Refunded),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_gateway_vocabularies() {
        assert_eq!(map_event_status("payment.captured"), PaymentStatus::Captured);
        assert_eq!(map_event_status("payment_intent.succeeded"), PaymentStatus::Captured);
        assert_eq!(map_event_status("order.paid"), PaymentStatus::RequiresAction);
        assert_eq!(map_event_status("payment.authorized"), PaymentStatus::Authorized);
        assert_eq!(map_event_status("refund.processed"), PaymentStatus::Refunded);
        assert_eq!(map_event_status("charge.refunded"), PaymentStatus::Refunded);
        assert_eq!(map_event_status("payment.failed"), PaymentStatus::Failed);
        assert_eq!(
            map_event_status("payment_intent.payment_failed"),
            PaymentStatus::Failed
        );
        assert_eq!(map_event_status(""), PaymentStatus::RequiresAction);
    }

    #[test]
    fn test_mapping_is_case_insensitive() {
        assert_eq!(map_event_status("PAYMENT.CAPTURED"), PaymentStatus::Captured);
        assert_eq!(map_event_status("Payment.Authorized"), PaymentStatus::Authorized);
    }

    #[test]
    fn test_status_never_regresses() {
        assert!(advances(PaymentStatus::RequiresAction, PaymentStatus::Authorized));
        assert!(advances(PaymentStatus::Authorized, PaymentStatus::Captured));
        assert!(advances(PaymentStatus::Failed, PaymentStatus::Captured));
        assert!(advances(PaymentStatus::Captured, PaymentStatus::Refunded));
        assert!(!advances(PaymentStatus::Captured, PaymentStatus::Authorized));
        assert!(!advances(PaymentStatus::Captured, PaymentStatus::Failed));
        assert!(!advances(PaymentStatus::Captured, PaymentStatus::Captured));
    }

    #[test]
    fn test_lifecycle_targets() {
        assert_eq!(
            lifecycle_target(PaymentStatus::Captured),
            Some(LifecycleStatus::PaymentConfirmed)
        );
        assert_eq!(
            lifecycle_target(PaymentStatus::Refunded),
            Some(LifecycleStatus::Refunded)
        );
        assert_eq!(lifecycle_target(PaymentStatus::Authorized), None);
    }
}

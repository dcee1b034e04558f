use crate::types::LifecycleStatus;

/// Storage failures, classified so callers can tell a lost uniqueness race or
/// a missing schema object apart from a transient fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("collection does not exist: {0}")]
    UndefinedCollection(String),
    #[error("column does not exist: {0}")]
    UndefinedColumn(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Classifies a driver message when no structured error code is available.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("duplicate key") || lowered.contains("unique constraint") {
            StoreError::UniqueViolation(message)
        } else if lowered.contains("column") && lowered.contains("does not exist") {
            StoreError::UndefinedColumn(message)
        } else if lowered.contains("relation") && lowered.contains("does not exist") {
            StoreError::UndefinedCollection(message)
        } else {
            StoreError::Unavailable(message)
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    /// True when the target collection or one of the written fields is absent.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(
            self,
            StoreError::UndefinedCollection(_) | StoreError::UndefinedColumn(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("booking {0} not found")]
    BookingNotFound(String),
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: LifecycleStatus,
        to: LifecycleStatus,
    },
    #[error("idempotency key is required")]
    MissingIdempotencyKey,
    #[error("lifecycle persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl LifecycleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LifecycleError::Persistence(_))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PaymentError {
    #[error("booking {0} not found")]
    BookingNotFound(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error("webhook signature could not be verified")]
    SignatureInvalid,
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("payment persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("dedup reservation failed: {0}")]
    Reservation(#[source] StoreError),
    #[error("lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("failure {0} does not carry a retryable channel")]
    NotRetryable(String),
}

/// Outcome of a single side-channel call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("provider timed out after {0}s")]
    Timeout(u64),
    #[error("provider rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("task store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_postgres_duplicate_key_message() {
        let err = StoreError::from_message(
            "duplicate key value violates unique constraint \"automation_dedup_key_window\"",
        );
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_classifies_missing_relation() {
        let err = StoreError::from_message("relation \"automation_dedup\" does not exist");
        assert_eq!(
            err,
            StoreError::UndefinedCollection(
                "relation \"automation_dedup\" does not exist".to_string()
            )
        );
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_classifies_missing_column() {
        let err = StoreError::from_message(
            "column \"scope_value\" of relation \"automation_dedup\" does not exist",
        );
        assert!(matches!(err, StoreError::UndefinedColumn(_)));
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_unrecognised_message_is_transient() {
        let err = StoreError::from_message("connection reset by peer");
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(!err.is_schema_mismatch());
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn test_lifecycle_retryability() {
        assert!(LifecycleError::Persistence(StoreError::Unavailable("x".into())).is_retryable());
        assert!(!LifecycleError::BookingNotFound("bk_1".into()).is_retryable());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = LifecycleError::InvalidTransition {
            from: LifecycleStatus::Refunded,
            to: LifecycleStatus::PaymentPending,
        };
        assert_eq!(
            err.to_string(),
            "transition refunded -> payment_pending is not allowed"
        );
    }
}

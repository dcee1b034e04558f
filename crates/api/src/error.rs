use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::error;
use tripdesk_core::error::{DispatchError, LifecycleError, PaymentError, StoreError};

use crate::state::RequestId;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    RateLimited,
    Unavailable(String),
    Internal,
}

#[derive(Debug)]
pub struct ApiError {
    pub error: AppError,
    pub request_id: String,
}

impl AppError {
    pub fn with_request_id(self, request_id: &str) -> ApiError {
        ApiError {
            error: self,
            request_id: request_id.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRecord(message) => {
                error!(error = %message, "stored record could not be read");
                AppError::Internal
            }
            other => AppError::Unavailable(other.to_string()),
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::BookingNotFound(_) => AppError::NotFound(err.to_string()),
            LifecycleError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            LifecycleError::MissingIdempotencyKey => AppError::BadRequest(err.to_string()),
            LifecycleError::Persistence(store) => store.into(),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::BookingNotFound(_) => AppError::NotFound(err.to_string()),
            PaymentError::InvalidAmount(_) | PaymentError::InvalidPayload(_) => {
                AppError::BadRequest(err.to_string())
            }
            PaymentError::SignatureInvalid => AppError::Unauthorized(err.to_string()),
            PaymentError::Lifecycle(inner) => inner.into(),
            PaymentError::Persistence(store) => store.into(),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotRetryable(_) => AppError::Conflict(err.to_string()),
            DispatchError::Reservation(_) | DispatchError::Lookup(_) => {
                AppError::Unavailable(err.to_string())
            }
        }
    }
}

/// Attaches the request id while converting a domain error.
pub trait ResultExt<T> {
    fn or_api(self, request_id: &RequestId) -> ApiResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<AppError>,
{
    fn or_api(self, request_id: &RequestId) -> ApiResult<T> {
        self.map_err(|err| err.into().with_request_id(&request_id.0))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self.error {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests".to_string(),
            ),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Unexpected error".to_string(),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: code.to_string(),
                    message,
                    request_id: self.request_id,
                },
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;
    use tripdesk_core::types::LifecycleStatus;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_with_request_id() {
        let err = AppError::Internal.with_request_id("req_123");
        assert_eq!(err.request_id, "req_123");
    }

    #[test]
    fn test_bad_request_response() {
        rt().block_on(async {
            let err = AppError::BadRequest("missing field".to_string()).with_request_id("req_001");
            let (status, json) = body_json(err).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"]["code"], "invalid_request");
            assert_eq!(json["error"]["message"], "missing field");
            assert_eq!(json["error"]["request_id"], "req_001");
        });
    }

    #[test]
    fn test_invalid_transition_is_conflict() {
        rt().block_on(async {
            let err: AppError = LifecycleError::InvalidTransition {
                from: LifecycleStatus::Refunded,
                to: LifecycleStatus::PaymentPending,
            }
            .into();
            let (status, json) = body_json(err.with_request_id("req_002")).await;

            assert_eq!(status, StatusCode::CONFLICT);
            assert_eq!(json["error"]["code"], "conflict");
            assert_eq!(
                json["error"]["message"],
                "transition refunded -> payment_pending is not allowed"
            );
        });
    }

    #[test]
    fn test_signature_failure_is_unauthorized() {
        rt().block_on(async {
            let err: AppError = PaymentError::SignatureInvalid.into();
            let (status, json) = body_json(err.with_request_id("req_003")).await;

            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(json["error"]["code"], "unauthorized");
        });
    }

    #[test]
    fn test_persistence_failure_is_unavailable() {
        rt().block_on(async {
            let err: AppError = PaymentError::Lifecycle(LifecycleError::Persistence(
                StoreError::Unavailable("pool timed out".into()),
            ))
            .into();
            let (status, json) = body_json(err.with_request_id("req_004")).await;

            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(json["error"]["code"], "unavailable");
        });
    }

    #[test]
    fn test_not_found_response() {
        rt().block_on(async {
            let err: AppError = PaymentError::BookingNotFound("bk_9".into()).into();
            let (status, json) = body_json(err.with_request_id("req_005")).await;

            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(json["error"]["message"], "booking bk_9 not found");
        });
    }

    #[test]
    fn test_rate_limited_response() {
        rt().block_on(async {
            let err = AppError::RateLimited.with_request_id("req_006");
            let (status, json) = body_json(err).await;

            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(json["error"]["code"], "rate_limited");
            assert_eq!(json["error"]["message"], "Too many requests");
        });
    }

    #[test]
    fn test_invalid_record_hides_detail() {
        rt().block_on(async {
            let err: AppError = StoreError::InvalidRecord("unknown payment status 'x'".into()).into();
            let (status, json) = body_json(err.with_request_id("req_007")).await;

            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(json["error"]["message"], "Unexpected error");
        });
    }
}

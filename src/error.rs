// bookpay/src/error.rs
// Error taxonomy for the gateway client, the order store and the HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::orders::{OrderRecord, OrderStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// GATEWAY ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure to obtain a bearer token from the gateway's auth endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayAuthError {
    #[error("token request timed out")]
    Timeout,

    #[error("could not reach auth endpoint: {0}")]
    Connection(String),

    #[error("credentials rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed auth response: {0}")]
    MalformedResponse(String),

    #[error("auth response carried no token")]
    MissingToken,
}

impl GatewayAuthError {
    /// Timeouts and connection failures are worth retrying later. Everything
    /// else needs an operator to look at the credentials or the integration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connection(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] GatewayAuthError),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

impl GatewayError {
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Unavailable("request timed out".to_string())
        } else {
            Self::Unavailable(format!("connection failed: {}", err))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORE ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tracking id {0} already exists")]
    DuplicateTrackingId(String),

    #[error("no order with tracking id {0}")]
    NotFound(String),

    #[error("order {} is already {:?}", .0.tracking_id, .0.status)]
    AlreadyTerminal(Box<OrderRecord>),

    #[error("could not allocate a unique tracking id after {0} attempts")]
    TrackingIdExhausted(usize),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("record encoding: {}", err))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PAYMENT ERRORS (HTTP BOUNDARY)
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a download was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    NoRecord,
    NotCompleted(OrderStatus),
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRecord => "no-record",
            Self::NotCompleted(_) => "not-completed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NoRecord => {
                "No payment found for this resource, email and tracking id".to_string()
            }
            Self::NotCompleted(OrderStatus::Pending) => {
                "Payment is still pending. Please try again once it completes".to_string()
            }
            Self::NotCompleted(status) => format!("Payment was not completed (status: {})", status),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("{message}")]
    Validation { field: &'static str, message: String },

    #[error("resource {0} not found")]
    ResourceNotFound(i64),

    #[error("payment service temporarily unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("payment service configuration error: {0}")]
    GatewayMisconfigured(String),

    #[error("payment gateway rejected the request ({status}): {body}")]
    GatewayRejected { status: u16, body: String },

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("payment verification failed: {0}")]
    VerificationFailed(String),

    #[error("download forbidden: {}", .0.code())]
    Forbidden(DenyReason),

    #[error("{0}")]
    Internal(String),
}

impl PaymentError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for PaymentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Auth(auth) if auth.is_retryable() => {
                Self::GatewayUnavailable(auth.to_string())
            }
            GatewayError::Auth(auth) => Self::GatewayMisconfigured(auth.to_string()),
            GatewayError::Unavailable(reason) => Self::GatewayUnavailable(reason),
            GatewayError::Rejected { status, body } => Self::GatewayRejected { status, body },
            GatewayError::Malformed(reason) => Self::GatewayMisconfigured(reason),
        }
    }
}

impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::OrderNotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<OrderStatus>,
}

impl ErrorBody {
    fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            field: None,
            reason: None,
            status: None,
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let (code, body) = match &self {
            PaymentError::Validation { field, message } => {
                let mut body = ErrorBody::new(message.clone());
                body.field = Some(field);
                (StatusCode::BAD_REQUEST, body)
            }
            PaymentError::ResourceNotFound(_) | PaymentError::OrderNotFound(_) => {
                (StatusCode::NOT_FOUND, ErrorBody::new(self.to_string()))
            }
            PaymentError::GatewayUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new("Payment service temporarily unavailable. Please try again"),
            ),
            PaymentError::GatewayMisconfigured(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new("Payment service configuration error"),
            ),
            PaymentError::GatewayRejected { .. } => {
                (StatusCode::BAD_GATEWAY, ErrorBody::new(self.to_string()))
            }
            PaymentError::VerificationFailed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new("Could not verify payment status. Please try again shortly"),
            ),
            PaymentError::Forbidden(reason) => {
                let mut body = ErrorBody::new(reason.message());
                body.reason = Some(reason.code());
                if let DenyReason::NotCompleted(status) = reason {
                    body.status = Some(*status);
                }
                (StatusCode::FORBIDDEN, body)
            }
            PaymentError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("Internal server error"),
            ),
        };

        if code.is_server_error() {
            tracing::error!(status = %code, error = %self, "request failed");
        } else {
            tracing::debug!(status = %code, error = %self, "request rejected");
        }

        (code, Json(body)).into_response()
    }
}

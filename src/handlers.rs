// bookpay/src/handlers.rs
// HTTP surface: purchase, gateway IPN, status poll, download

use axum::{
    body::Body,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::download::DownloadGate;
use crate::error::PaymentError;
use crate::initiator::{PaymentInitiator, PurchaseRequest};
use crate::orders::{OrderBook, OrderRecord, OrderStatus, PaymentMode, ResourceRef};
use crate::reconcile::{Notification, ReconciliationEngine};

// ═══════════════════════════════════════════════════════════════════════════════
// STATE & ROUTER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct AppState {
    pub orders: OrderBook,
    pub initiator: PaymentInitiator,
    pub engine: ReconciliationEngine,
    pub gate: DownloadGate,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/pay", post(initiate_payment))
        .route("/pesapal/ipn", get(ipn_query).post(ipn_json))
        .route("/payment/:tracking_id", get(payment_status))
        .route("/payments/latest", get(latest_payment))
        .route("/download/:resource_id", get(download_resource))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
}

// ═══════════════════════════════════════════════════════════════════════════════
// PURCHASE
// ═══════════════════════════════════════════════════════════════════════════════

/// Storefront clients send ids and amounts as numbers or strings.
#[derive(Debug, Deserialize)]
pub struct PayRequest {
    resource_id: Option<Value>,
    email: Option<String>,
    amount: Option<Value>,
    name: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayResponse {
    success: bool,
    order_tracking_id: String,
    #[serde(rename = "redirect_url")]
    redirect_url: String,
    #[serde(rename = "payment_url", skip_serializing_if = "Option::is_none")]
    payment_url: Option<String>,
    mode: PaymentMode,
    message: &'static str,
}

fn number_field<T: std::str::FromStr>(value: &Value) -> Option<T> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_text(value: Option<String>, field: &'static str) -> Result<String, PaymentError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PaymentError::validation(field, format!("Missing required field: {}", field)))
}

impl TryFrom<PayRequest> for PurchaseRequest {
    type Error = PaymentError;

    fn try_from(req: PayRequest) -> Result<Self, Self::Error> {
        let resource_ref = req
            .resource_id
            .as_ref()
            .ok_or_else(|| PaymentError::validation("resource_id", "Missing required field: resource_id"))
            .and_then(|v| {
                number_field::<ResourceRef>(v)
                    .ok_or_else(|| PaymentError::validation("resource_id", "Invalid resource id"))
            })?;
        let amount = req
            .amount
            .as_ref()
            .ok_or_else(|| PaymentError::validation("amount", "Missing required field: amount"))
            .and_then(|v| {
                number_field::<f64>(v)
                    .ok_or_else(|| PaymentError::validation("amount", "Invalid amount"))
            })?;

        Ok(PurchaseRequest {
            resource_ref,
            email: required_text(req.email, "email")?,
            name: required_text(req.name, "name")?,
            phone: required_text(req.phone, "phone")?,
            amount,
        })
    }
}

pub async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PayRequest>,
) -> Result<Json<PayResponse>, PaymentError> {
    let request = PurchaseRequest::try_from(payload)?;
    let initiated = state.initiator.initiate(request).await?;

    let (payment_url, message) = match initiated.mode {
        PaymentMode::Gateway => (Some(initiated.redirect_url.clone()), "Payment initiated"),
        PaymentMode::Offline => (None, "Test payment completed (payment gateway not configured)"),
    };

    Ok(Json(PayResponse {
        success: true,
        order_tracking_id: initiated.tracking_id,
        redirect_url: initiated.redirect_url,
        payment_url,
        mode: initiated.mode,
        message,
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// IPN (GATEWAY NOTIFICATIONS)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct IpnParams {
    #[serde(
        rename = "OrderMerchantReference",
        alias = "orderMerchantReference",
        alias = "merchant_reference"
    )]
    merchant_reference: Option<String>,
    #[serde(
        rename = "OrderTrackingId",
        alias = "orderTrackingId",
        alias = "transaction_tracking_id"
    )]
    order_tracking_id: Option<String>,
    #[serde(rename = "OrderNotificationType", alias = "orderNotificationType")]
    notification_type: Option<String>,
    status: Option<String>,
    #[serde(alias = "confirmation_code")]
    transaction_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpnAck {
    order_notification_type: String,
    order_tracking_id: String,
    order_merchant_reference: String,
    status: u16,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn ipn_query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IpnParams>,
) -> Response {
    handle_ipn(&state, params).await
}

pub async fn ipn_json(State(state): State<Arc<AppState>>, Json(params): Json<IpnParams>) -> Response {
    handle_ipn(&state, params).await
}

async fn handle_ipn(state: &AppState, params: IpnParams) -> Response {
    let notification_type =
        clean(params.notification_type).unwrap_or_else(|| "IPNCHANGE".to_string());
    let order_tracking_id = clean(params.order_tracking_id);
    let reference = clean(params.merchant_reference);

    let ack = |code: StatusCode, reference: String| {
        let body = IpnAck {
            order_notification_type: notification_type.clone(),
            order_tracking_id: order_tracking_id.clone().unwrap_or_default(),
            order_merchant_reference: reference,
            status: if code.is_success() { 200 } else { code.as_u16() },
        };
        (code, Json(body)).into_response()
    };

    let Some(reference) = reference else {
        warn!("[IPN] notification without merchant reference");
        return ack(StatusCode::BAD_REQUEST, String::new());
    };

    info!(
        tracking_id = %reference,
        gateway_order_id = ?order_tracking_id,
        status = ?params.status,
        "[IPN] received"
    );

    let notification = Notification {
        merchant_reference: reference.clone(),
        status: clean(params.status),
        transaction_id: clean(params.transaction_id),
        gateway_order_id: order_tracking_id.clone(),
    };

    match state.engine.notify(notification).await {
        Ok(outcome) => {
            info!(
                tracking_id = %reference,
                status = %outcome.record().status,
                "[IPN] acknowledged"
            );
            ack(StatusCode::OK, reference)
        }
        Err(PaymentError::OrderNotFound(_)) => ack(StatusCode::NOT_FOUND, reference),
        // Gateway redelivers on non-2xx, which is what we want here.
        Err(PaymentError::VerificationFailed(reason)) => {
            warn!(tracking_id = %reference, reason = %reason, "[IPN] verification failed");
            ack(StatusCode::SERVICE_UNAVAILABLE, reference)
        }
        Err(e) => {
            error!(tracking_id = %reference, error = %e, "[IPN] processing error");
            ack(StatusCode::INTERNAL_SERVER_ERROR, reference)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATUS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct OrderView {
    success: bool,
    #[serde(rename = "orderTrackingId")]
    tracking_id: String,
    resource_id: ResourceRef,
    status: OrderStatus,
    mode: PaymentMode,
    notification_received: bool,
    amount: f64,
    currency: String,
    payment_method: Option<String>,
    confirmation_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRecord> for OrderView {
    fn from(record: OrderRecord) -> Self {
        Self {
            success: true,
            tracking_id: record.tracking_id,
            resource_id: record.resource_ref,
            status: record.status,
            mode: record.mode,
            notification_received: record.notification_received,
            amount: record.amount,
            currency: record.currency,
            payment_method: record.payment_method,
            confirmation_code: record.gateway_transaction_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

pub async fn payment_status(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
) -> Result<Json<OrderView>, PaymentError> {
    let outcome = state.engine.query_status(tracking_id.trim()).await?;
    Ok(Json(outcome.into_record().into()))
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    resource_id: ResourceRef,
    email: String,
}

#[derive(Debug, Serialize)]
pub struct LatestView {
    success: bool,
    resource_id: ResourceRef,
    status: OrderStatus,
    notification_received: bool,
    created_at: DateTime<Utc>,
}

/// Latest attempt for a requester. The tracking id is deliberately absent: it
/// is the second factor for downloads.
pub async fn latest_payment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<LatestView>, PaymentError> {
    let record = state
        .orders
        .latest_for(query.resource_id, &query.email)
        .await?
        .ok_or_else(|| PaymentError::OrderNotFound(format!("for resource {}", query.resource_id)))?;

    Ok(Json(LatestView {
        success: true,
        resource_id: record.resource_ref,
        status: record.status,
        notification_received: record.notification_received,
        created_at: record.created_at,
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOWNLOAD
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    email: Option<String>,
    #[serde(rename = "orderTrackingId", alias = "tracking_id")]
    tracking_id: Option<String>,
}

fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("epub") => "application/epub+zip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

pub async fn download_resource(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<ResourceRef>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, PaymentError> {
    let email = required_text(query.email, "email")?;
    let tracking_id = required_text(query.tracking_id, "orderTrackingId")?;

    let handle = state.gate.authorize(resource_id, &email, &tracking_id).await?;

    let file = match tokio::fs::File::open(&handle.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PaymentError::ResourceNotFound(resource_id))
        }
        Err(e) => {
            return Err(PaymentError::Internal(format!(
                "opening {}: {}",
                handle.path.display(),
                e
            )))
        }
    };
    let size = file
        .metadata()
        .await
        .map_err(|e| PaymentError::Internal(format!("stat {}: {}", handle.path.display(), e)))?
        .len();

    info!(
        resource_id,
        title = %handle.title,
        tracking_id = %tracking_id,
        bytes = size,
        "serving download"
    );

    let disposition = format!(
        "attachment; filename=\"{}\"",
        handle.file_name.replace('"', "")
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(&handle.file_name).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

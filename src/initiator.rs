// bookpay/src/initiator.rs
// Purchase initiation: validate, submit to the gateway, persist a PENDING order

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::catalog::ResourceCatalog;
use crate::error::PaymentError;
use crate::orders::{normalize_email, NewOrder, OrderBook, OrderStatus, PaymentMode, ResourceRef};
use crate::pesapal::{Billing, OrderSubmission, PaymentGateway};

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub resource_ref: ResourceRef,
    pub email: String,
    pub name: String,
    pub phone: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedPayment {
    pub tracking_id: String,
    pub redirect_url: String,
    pub mode: PaymentMode,
}

/// Without a gateway the initiator runs in offline mode and completes orders
/// locally. Those records carry `PaymentMode::Offline`.
#[derive(Clone)]
pub struct PaymentInitiator {
    orders: OrderBook,
    catalog: Arc<dyn ResourceCatalog>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    audit: AuditLog,
    currency: String,
    offline_success_url: String,
}

impl PaymentInitiator {
    pub fn new(
        orders: OrderBook,
        catalog: Arc<dyn ResourceCatalog>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        audit: AuditLog,
        currency: String,
        offline_success_url: String,
    ) -> Self {
        Self {
            orders,
            catalog,
            gateway,
            audit,
            currency,
            offline_success_url,
        }
    }

    pub async fn initiate(&self, request: PurchaseRequest) -> Result<InitiatedPayment, PaymentError> {
        validate(&request)?;

        let resource = self
            .catalog
            .find(request.resource_ref)
            .await
            .ok_or(PaymentError::ResourceNotFound(request.resource_ref))?;

        let email = normalize_email(&request.email);
        let draft = NewOrder {
            resource_ref: request.resource_ref,
            requester_email: email.clone(),
            customer_name: request.name.trim().to_string(),
            phone: request.phone.trim().to_string(),
            amount: request.amount,
            currency: self.currency.clone(),
            gateway_order_id: None,
            mode: PaymentMode::Gateway,
        };

        let Some(gateway) = &self.gateway else {
            return self.complete_offline(draft).await;
        };

        let tracking_id = self.orders.allocate_tracking_id().await?;
        let (first_name, last_name) = split_name(&draft.customer_name);
        let submission = OrderSubmission {
            tracking_id: tracking_id.clone(),
            amount: draft.amount,
            currency: draft.currency.clone(),
            description: format!("Payment for {}", resource.title),
            billing: Billing {
                email: email.clone(),
                phone: draft.phone.clone(),
                first_name,
                last_name,
            },
        };

        // A failure here leaves nothing behind; the client simply retries with
        // a new tracking id.
        let submitted = gateway.submit_order(&submission).await.map_err(|e| {
            warn!(tracking_id = %tracking_id, error = %e, "order submission failed");
            PaymentError::from(e)
        })?;

        let record = self
            .orders
            .create(
                tracking_id,
                NewOrder {
                    gateway_order_id: Some(submitted.gateway_order_id.clone()),
                    ..draft
                },
                OrderStatus::Pending,
            )
            .await?;

        self.audit
            .record(
                AuditEvent::OrderCreated,
                &record,
                json!({ "gateway_order_id": submitted.gateway_order_id }),
            )
            .await;
        info!(
            tracking_id = %record.tracking_id,
            resource_ref = record.resource_ref,
            amount = record.amount,
            "payment initiated"
        );

        Ok(InitiatedPayment {
            tracking_id: record.tracking_id,
            redirect_url: submitted.redirect_url,
            mode: PaymentMode::Gateway,
        })
    }

    async fn complete_offline(&self, draft: NewOrder) -> Result<InitiatedPayment, PaymentError> {
        let record = self
            .orders
            .create_with_fresh_id(
                NewOrder {
                    mode: PaymentMode::Offline,
                    ..draft
                },
                OrderStatus::Completed,
            )
            .await?;

        self.audit
            .record(
                AuditEvent::OrderCreated,
                &record,
                json!({ "reason": "gateway credentials not configured" }),
            )
            .await;
        warn!(
            tracking_id = %record.tracking_id,
            resource_ref = record.resource_ref,
            "offline mode: order completed without a gateway"
        );

        let redirect_url = reqwest::Url::parse_with_params(
            &self.offline_success_url,
            &[
                ("resource_id", record.resource_ref.to_string()),
                ("email", record.requester_email.clone()),
                ("orderTrackingId", record.tracking_id.clone()),
            ],
        )
        .map_err(|e| PaymentError::Internal(format!("bad offline success url: {}", e)))?;

        Ok(InitiatedPayment {
            tracking_id: record.tracking_id,
            redirect_url: redirect_url.into(),
            mode: PaymentMode::Offline,
        })
    }
}

fn validate(request: &PurchaseRequest) -> Result<(), PaymentError> {
    if !request.amount.is_finite() || request.amount <= 0.0 {
        return Err(PaymentError::validation(
            "amount",
            "Amount must be a positive number",
        ));
    }

    let email = request.email.trim();
    let valid_email = !email.contains(char::is_whitespace)
        && match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.find('.').is_some_and(|dot| dot > 0 && dot < domain.len() - 1)
            }
            None => false,
        };
    if !valid_email {
        return Err(PaymentError::validation("email", "Invalid email address"));
    }

    if request.name.trim().is_empty() {
        return Err(PaymentError::validation("name", "Name is required"));
    }
    if request.phone.trim().is_empty() {
        return Err(PaymentError::validation("phone", "Phone number is required"));
    }
    Ok(())
}

fn split_name(full: &str) -> (String, String) {
    match full.trim().split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (full.trim().to_string(), String::new()),
    }
}

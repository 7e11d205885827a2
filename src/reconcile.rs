// bookpay/src/reconcile.rs
// Reconciliation of PENDING orders against gateway notifications and status
// queries. Safe to run any number of times for the same order.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{PaymentError, StoreError};
use crate::orders::{GatewayStatus, OrderBook, OrderRecord, Transition};
use crate::pesapal::PaymentGateway;

/// An inbound gateway callback, already parsed.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub merchant_reference: String,
    pub status: Option<String>,
    pub transaction_id: Option<String>,
    pub gateway_order_id: Option<String>,
}

/// Outcome of one reconciliation pass. All three are successes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Transitioned(OrderRecord),
    AlreadyTerminal(OrderRecord),
    StillPending(OrderRecord),
}

impl Reconciliation {
    pub fn record(&self) -> &OrderRecord {
        match self {
            Reconciliation::Transitioned(r)
            | Reconciliation::AlreadyTerminal(r)
            | Reconciliation::StillPending(r) => r,
        }
    }

    pub fn into_record(self) -> OrderRecord {
        match self {
            Reconciliation::Transitioned(r)
            | Reconciliation::AlreadyTerminal(r)
            | Reconciliation::StillPending(r) => r,
        }
    }
}

/// A status report from one of the two channels.
struct Observation {
    raw_status: String,
    transaction_id: Option<String>,
    payment_method: Option<String>,
    source: &'static str,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    orders: OrderBook,
    gateway: Option<Arc<dyn PaymentGateway>>,
    audit: AuditLog,
}

impl ReconciliationEngine {
    pub fn new(
        orders: OrderBook,
        gateway: Option<Arc<dyn PaymentGateway>>,
        audit: AuditLog,
    ) -> Self {
        Self {
            orders,
            gateway,
            audit,
        }
    }

    /// Handles a gateway callback. Unknown references are `OrderNotFound`;
    /// duplicates and late deliveries for settled orders come back as
    /// `AlreadyTerminal`.
    pub async fn notify(&self, notification: Notification) -> Result<Reconciliation, PaymentError> {
        let reference = notification.merchant_reference.as_str();

        // Callback payloads are unauthenticated. With a query channel only the
        // gateway's own report may fill the transaction id.
        let claimed_transaction_id = match &self.gateway {
            Some(_) => None,
            None => notification.transaction_id.as_deref(),
        };
        let record = match self
            .orders
            .mark_notified(reference, claimed_transaction_id)
            .await
        {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                warn!(tracking_id = %reference, "notification for unknown order");
                return Err(PaymentError::OrderNotFound(reference.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        self.audit
            .record(
                AuditEvent::NotificationReceived,
                &record,
                json!({
                    "status": notification.status,
                    "transaction_id": notification.transaction_id,
                    "gateway_order_id": notification.gateway_order_id,
                }),
            )
            .await;

        if record.status.is_terminal() {
            debug!(
                tracking_id = %record.tracking_id,
                status = %record.status,
                "order already settled, acknowledging"
            );
            return Ok(Reconciliation::AlreadyTerminal(record));
        }

        if let (Some(claimed), Some(known)) = (&notification.gateway_order_id, &record.gateway_order_id)
        {
            if claimed != known {
                warn!(
                    tracking_id = %record.tracking_id,
                    claimed = %claimed,
                    known = %known,
                    "notification gateway order id does not match record"
                );
            }
        }

        let observation = self
            .observe(&record, notification.status, notification.transaction_id)
            .await?;
        self.settle(record, observation).await
    }

    /// Client poll: re-checks a PENDING order with the gateway.
    pub async fn query_status(&self, tracking_id: &str) -> Result<Reconciliation, PaymentError> {
        let record = self
            .orders
            .get(tracking_id)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(tracking_id.to_string()))?;

        if record.status.is_terminal() {
            return Ok(Reconciliation::AlreadyTerminal(record));
        }

        let observation = self.observe(&record, None, None).await?;
        self.settle(record, observation).await
    }

    /// Picks the status to act on. A gateway query wins whenever one is
    /// possible; the callback's own status is used only when it is not.
    async fn observe(
        &self,
        record: &OrderRecord,
        async_status: Option<String>,
        async_transaction_id: Option<String>,
    ) -> Result<Option<Observation>, PaymentError> {
        let (Some(gateway), Some(gateway_order_id)) = (&self.gateway, &record.gateway_order_id)
        else {
            return Ok(async_status.map(|raw_status| Observation {
                raw_status,
                transaction_id: async_transaction_id,
                payment_method: None,
                source: "notification",
            }));
        };

        let reported = gateway.query_status(gateway_order_id).await.map_err(|e| {
            warn!(
                tracking_id = %record.tracking_id,
                error = %e,
                "status query failed, leaving order pending"
            );
            PaymentError::VerificationFailed(e.to_string())
        })?;

        if let Some(reference) = &reported.merchant_reference {
            if reference != &record.tracking_id {
                error!(
                    tracking_id = %record.tracking_id,
                    reported = %reference,
                    "gateway status refers to a different order"
                );
                return Err(PaymentError::VerificationFailed(
                    "merchant reference mismatch".to_string(),
                ));
            }
        }

        Ok(Some(Observation {
            raw_status: reported.status,
            transaction_id: reported.confirmation_code,
            payment_method: reported.payment_method,
            source: "query",
        }))
    }

    async fn settle(
        &self,
        record: OrderRecord,
        observation: Option<Observation>,
    ) -> Result<Reconciliation, PaymentError> {
        let Some(observation) = observation else {
            return Ok(Reconciliation::StillPending(record));
        };

        let target = match GatewayStatus::parse(&observation.raw_status) {
            GatewayStatus::Terminal(status) => status,
            GatewayStatus::Pending => return Ok(Reconciliation::StillPending(record)),
            GatewayStatus::Unrecognized(raw) => {
                warn!(
                    tracking_id = %record.tracking_id,
                    status = %raw,
                    source = observation.source,
                    "unrecognized gateway status, order stays pending"
                );
                self.audit
                    .record(
                        AuditEvent::UnrecognizedStatus,
                        &record,
                        json!({ "reported": raw, "source": observation.source }),
                    )
                    .await;
                return Ok(Reconciliation::StillPending(record));
            }
        };

        let transition = Transition {
            status: target,
            gateway_transaction_id: observation.transaction_id,
            payment_method: observation.payment_method,
        };

        match self
            .orders
            .apply_transition(&record.tracking_id, transition)
            .await
        {
            Ok(updated) => {
                info!(
                    tracking_id = %updated.tracking_id,
                    status = %updated.status,
                    source = observation.source,
                    "order settled"
                );
                self.audit
                    .record(
                        AuditEvent::OrderTransition,
                        &updated,
                        json!({ "from": record.status, "source": observation.source }),
                    )
                    .await;
                Ok(Reconciliation::Transitioned(updated))
            }
            // Lost a race with another delivery. The winner's status stands.
            Err(StoreError::AlreadyTerminal(current)) => {
                debug!(
                    tracking_id = %current.tracking_id,
                    status = %current.status,
                    "concurrent settlement won elsewhere"
                );
                Ok(Reconciliation::AlreadyTerminal(*current))
            }
            Err(e) => Err(e.into()),
        }
    }
}

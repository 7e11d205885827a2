// bookpay/src/testing.rs
// In-process gateway double shared by the unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::pesapal::{OrderSubmission, PaymentGateway, SubmittedOrder, TransactionStatus};

#[derive(Default)]
pub struct FakeGateway {
    submissions: Mutex<Vec<OrderSubmission>>,
    submit_failure: Mutex<Option<GatewayError>>,
    statuses: Mutex<HashMap<String, Result<TransactionStatus, GatewayError>>>,
    queries: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submissions(&self) -> Vec<OrderSubmission> {
        self.submissions.lock().await.clone()
    }

    pub async fn fail_submissions(&self, err: GatewayError) {
        *self.submit_failure.lock().await = Some(err);
    }

    /// What a status query for `gateway_order_id` will report.
    pub async fn set_status(&self, gateway_order_id: &str, status: &str, confirmation: Option<&str>) {
        self.statuses.lock().await.insert(
            gateway_order_id.to_string(),
            Ok(TransactionStatus {
                status: status.to_string(),
                confirmation_code: confirmation.map(str::to_string),
                payment_method: Some("M-Pesa".to_string()),
                merchant_reference: None,
            }),
        );
    }

    pub async fn set_report(&self, gateway_order_id: &str, report: TransactionStatus) {
        self.statuses
            .lock()
            .await
            .insert(gateway_order_id.to_string(), Ok(report));
    }

    pub async fn fail_status(&self, gateway_order_id: &str, err: GatewayError) {
        self.statuses
            .lock()
            .await
            .insert(gateway_order_id.to_string(), Err(err));
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn submit_order(&self, order: &OrderSubmission) -> Result<SubmittedOrder, GatewayError> {
        self.submissions.lock().await.push(order.clone());
        if let Some(err) = self.submit_failure.lock().await.clone() {
            return Err(err);
        }
        let gateway_order_id = format!("gw-{}", order.tracking_id);
        Ok(SubmittedOrder {
            redirect_url: format!("https://pay.example/{}", gateway_order_id),
            gateway_order_id,
        })
    }

    async fn query_status(
        &self,
        gateway_order_id: &str,
    ) -> Result<TransactionStatus, GatewayError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .await
            .get(gateway_order_id)
            .cloned()
            .unwrap_or_else(|| {
                Ok(TransactionStatus {
                    status: "PENDING".to_string(),
                    confirmation_code: None,
                    payment_method: None,
                    merchant_reference: None,
                })
            })
    }
}

// bookpay/src/orders.rs
// Order records: one per payment attempt, persisted behind a swappable store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

/// Collisions on a fresh UUID are not expected on the normal path. The bound
/// only keeps a broken generator from spinning forever.
pub const MAX_TRACKING_ID_ATTEMPTS: usize = 5;

pub type ResourceRef = i64;

// ═══════════════════════════════════════════════════════════════════════════════
// ORDER TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string as reported by the gateway, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Terminal(OrderStatus),
    Pending,
    Unrecognized(String),
}

impl GatewayStatus {
    /// Case-insensitive. Anything outside the known vocabulary is kept verbatim
    /// as `Unrecognized` and never resolves an order.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" => GatewayStatus::Terminal(OrderStatus::Completed),
            "FAILED" => GatewayStatus::Terminal(OrderStatus::Failed),
            "CANCELLED" | "CANCELED" => GatewayStatus::Terminal(OrderStatus::Cancelled),
            "PENDING" => GatewayStatus::Pending,
            _ => GatewayStatus::Unrecognized(raw.to_string()),
        }
    }
}

/// Whether the record reflects a real gateway payment or the offline demo path.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMode {
    Gateway,
    Offline,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub tracking_id: String,
    pub gateway_order_id: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub payment_method: Option<String>,
    pub resource_ref: ResourceRef,
    pub requester_email: String,
    pub customer_name: String,
    pub phone: String,
    pub amount: f64,
    pub currency: String,
    pub status: OrderStatus,
    pub mode: PaymentMode,
    pub notification_received: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the initiator knows about an order before it has an id.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub resource_ref: ResourceRef,
    pub requester_email: String,
    pub customer_name: String,
    pub phone: String,
    pub amount: f64,
    pub currency: String,
    pub gateway_order_id: Option<String>,
    pub mode: PaymentMode,
}

impl OrderRecord {
    pub fn new(tracking_id: String, order: NewOrder, status: OrderStatus) -> Self {
        let now = Utc::now();
        Self {
            tracking_id,
            gateway_order_id: order.gateway_order_id,
            gateway_transaction_id: None,
            payment_method: None,
            resource_ref: order.resource_ref,
            requester_email: normalize_email(&order.requester_email),
            customer_name: order.customer_name,
            phone: order.phone,
            amount: order.amount,
            currency: order.currency,
            status,
            mode: order.mode,
            notification_received: false,
            notified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a transition in place. Callers guarantee the record is pending.
    pub(crate) fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) {
        self.status = transition.status;
        if let Some(tx) = &transition.gateway_transaction_id {
            self.gateway_transaction_id = Some(tx.clone());
        }
        if let Some(method) = &transition.payment_method {
            self.payment_method = Some(method.clone());
        }
        self.updated_at = at;
    }

    pub(crate) fn mark_notified(&mut self, gateway_transaction_id: Option<&str>, at: DateTime<Utc>) {
        if !self.notification_received {
            self.notification_received = true;
            self.notified_at = Some(at);
        }
        if self.gateway_transaction_id.is_none() {
            self.gateway_transaction_id = gateway_transaction_id.map(str::to_string);
        }
    }
}

/// A requested move out of PENDING.
#[derive(Clone, Debug)]
pub struct Transition {
    pub status: OrderStatus,
    pub gateway_transaction_id: Option<String>,
    pub payment_method: Option<String>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORE CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence for order records. Every method is atomic on its own.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new record, failing with `DuplicateTrackingId` rather than
    /// overwriting.
    async fn insert(&self, record: OrderRecord) -> Result<OrderRecord, StoreError>;

    async fn get(&self, tracking_id: &str) -> Result<Option<OrderRecord>, StoreError>;

    /// Most recently created record for the pair. `email` is already normalized.
    async fn latest_for(
        &self,
        resource_ref: ResourceRef,
        email: &str,
    ) -> Result<Option<OrderRecord>, StoreError>;

    /// The only status mutation. Succeeds only when the record is PENDING;
    /// otherwise returns `AlreadyTerminal` carrying the unchanged record.
    async fn apply_transition(
        &self,
        tracking_id: &str,
        transition: Transition,
    ) -> Result<OrderRecord, StoreError>;

    /// Flags that the gateway has spoken about this order and fills the
    /// gateway transaction id if it is still empty. Never touches `status`.
    async fn mark_notified(
        &self,
        tracking_id: &str,
        gateway_transaction_id: Option<&str>,
    ) -> Result<OrderRecord, StoreError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, OrderRecord>,
    // insertion order per (resource, email)
    by_requester: HashMap<(ResourceRef, String), Vec<String>>,
}

#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, record: OrderRecord) -> Result<OrderRecord, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.tracking_id) {
            return Err(StoreError::DuplicateTrackingId(record.tracking_id));
        }
        inner
            .by_requester
            .entry((record.resource_ref, record.requester_email.clone()))
            .or_default()
            .push(record.tracking_id.clone());
        inner
            .records
            .insert(record.tracking_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, tracking_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(tracking_id).cloned())
    }

    async fn latest_for(
        &self,
        resource_ref: ResourceRef,
        email: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_requester
            .get(&(resource_ref, email.to_string()))
            .and_then(|ids| ids.last())
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn apply_transition(
        &self,
        tracking_id: &str,
        transition: Transition,
    ) -> Result<OrderRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(tracking_id)
            .ok_or_else(|| StoreError::NotFound(tracking_id.to_string()))?;

        if record.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(Box::new(record.clone())));
        }

        record.apply(&transition, Utc::now());
        Ok(record.clone())
    }

    async fn mark_notified(
        &self,
        tracking_id: &str,
        gateway_transaction_id: Option<&str>,
    ) -> Result<OrderRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(tracking_id)
            .ok_or_else(|| StoreError::NotFound(tracking_id.to_string()))?;
        record.mark_notified(gateway_transaction_id, Utc::now());
        Ok(record.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORDER BOOK
// ═══════════════════════════════════════════════════════════════════════════════

pub type TrackingIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn default_tracking_id() -> String {
    format!("BK-{}", Uuid::new_v4().simple())
}

/// Store plus tracking id allocation. This is what the payment components hold.
#[derive(Clone)]
pub struct OrderBook {
    store: Arc<dyn OrderStore>,
    next_id: TrackingIdGenerator,
}

impl OrderBook {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self::with_generator(store, Arc::new(default_tracking_id))
    }

    pub fn with_generator(store: Arc<dyn OrderStore>, next_id: TrackingIdGenerator) -> Self {
        Self { store, next_id }
    }

    /// Picks an id that no record currently uses. The id has to exist before
    /// the gateway order does, since it travels as the merchant reference.
    pub async fn allocate_tracking_id(&self) -> Result<String, StoreError> {
        for _ in 0..MAX_TRACKING_ID_ATTEMPTS {
            let candidate = (self.next_id)();
            if self.store.get(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            tracing::warn!(tracking_id = %candidate, "tracking id collision, regenerating");
        }
        Err(StoreError::TrackingIdExhausted(MAX_TRACKING_ID_ATTEMPTS))
    }

    /// Persists an order under an id obtained from `allocate_tracking_id`.
    pub async fn create(
        &self,
        tracking_id: String,
        order: NewOrder,
        status: OrderStatus,
    ) -> Result<OrderRecord, StoreError> {
        self.store
            .insert(OrderRecord::new(tracking_id, order, status))
            .await
    }

    /// Persists an order under a freshly generated id, regenerating on
    /// collision up to `MAX_TRACKING_ID_ATTEMPTS` times.
    pub async fn create_with_fresh_id(
        &self,
        order: NewOrder,
        status: OrderStatus,
    ) -> Result<OrderRecord, StoreError> {
        for _ in 0..MAX_TRACKING_ID_ATTEMPTS {
            let record = OrderRecord::new((self.next_id)(), order.clone(), status);
            match self.store.insert(record).await {
                Err(StoreError::DuplicateTrackingId(id)) => {
                    tracing::warn!(tracking_id = %id, "tracking id collision, regenerating");
                }
                other => return other,
            }
        }
        Err(StoreError::TrackingIdExhausted(MAX_TRACKING_ID_ATTEMPTS))
    }

    pub async fn get(&self, tracking_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        self.store.get(tracking_id).await
    }

    pub async fn latest_for(
        &self,
        resource_ref: ResourceRef,
        email: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        self.store
            .latest_for(resource_ref, &normalize_email(email))
            .await
    }

    pub async fn apply_transition(
        &self,
        tracking_id: &str,
        transition: Transition,
    ) -> Result<OrderRecord, StoreError> {
        self.store.apply_transition(tracking_id, transition).await
    }

    pub async fn mark_notified(
        &self,
        tracking_id: &str,
        gateway_transaction_id: Option<&str>,
    ) -> Result<OrderRecord, StoreError> {
        self.store
            .mark_notified(tracking_id, gateway_transaction_id)
            .await
    }
}

#[cfg(test)]
pub(crate) fn sample_order(resource_ref: ResourceRef, email: &str) -> NewOrder {
    NewOrder {
        resource_ref,
        requester_email: email.to_string(),
        customer_name: "Test User".to_string(),
        phone: "+254700000000".to_string(),
        amount: 100.0,
        currency: "KES".to_string(),
        gateway_order_id: Some(format!("gw-{}", Uuid::new_v4())),
        mode: PaymentMode::Gateway,
    }
}

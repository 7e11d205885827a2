// bookpay/src/audit.rs
// Append-only audit trail for order lifecycle events, hash-chained with SHA-256

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::orders::OrderRecord;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    OrderCreated,
    OrderTransition,
    NotificationReceived,
    UnrecognizedStatus,
}

impl AuditEvent {
    fn as_str(self) -> &'static str {
        match self {
            AuditEvent::OrderCreated => "order.created",
            AuditEvent::OrderTransition => "order.transition",
            AuditEvent::NotificationReceived => "notification.received",
            AuditEvent::UnrecognizedStatus => "notification.unrecognized_status",
        }
    }
}

struct AuditState {
    last_hash: String,
    file: Option<File>,
}

#[derive(Clone)]
pub struct AuditLog {
    state: Arc<Mutex<AuditState>>,
}

fn chain_hash(prev_hash: &str, entry: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(entry.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl AuditLog {
    /// Entries only go to tracing.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(AuditState {
                last_hash: GENESIS_HASH.to_string(),
                file: None,
            })),
        }
    }

    /// Appends to `path`, continuing the chain from its last entry.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let last_hash = match tokio::fs::read_to_string(path).await {
            Ok(existing) => existing
                .lines()
                .rev()
                .find_map(|line| {
                    serde_json::from_str::<Value>(line)
                        .ok()
                        .and_then(|v| v["hash"].as_str().map(str::to_string))
                })
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GENESIS_HASH.to_string(),
            Err(e) => return Err(e),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            state: Arc::new(Mutex::new(AuditState {
                last_hash,
                file: Some(file),
            })),
        })
    }

    /// Records an event. A failed file write is logged, never propagated:
    /// the order store stays the source of truth.
    pub async fn record(&self, event: AuditEvent, order: &OrderRecord, detail: Value) {
        let mut state = self.state.lock().await;

        let mut entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event.as_str(),
            "tracking_id": order.tracking_id,
            "resource_ref": order.resource_ref,
            "email": order.requester_email,
            "status": order.status,
            "mode": order.mode,
            "amount": order.amount,
            "currency": order.currency,
            "detail": detail,
            "prev_hash": state.last_hash,
        });
        let hash = chain_hash(&state.last_hash, &entry);
        entry["hash"] = Value::String(hash.clone());

        tracing::info!(target: "audit", "{}", entry);

        if let Some(file) = state.file.as_mut() {
            let line = format!("{}\n", entry);
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::error!(error = %e, tracking_id = %order.tracking_id, "audit write failed");
            } else if let Err(e) = file.flush().await {
                tracing::error!(error = %e, tracking_id = %order.tracking_id, "audit flush failed");
            }
        }

        state.last_hash = hash;
    }
}

// bookpay/src/download.rs
// Download authorization: a completed order for exactly this resource,
// requester and tracking id.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::ResourceCatalog;
use crate::error::{DenyReason, PaymentError};
use crate::orders::{normalize_email, OrderBook, OrderStatus, ResourceRef};

#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    pub path: PathBuf,
    pub file_name: String,
    pub title: String,
}

#[derive(Clone)]
pub struct DownloadGate {
    orders: OrderBook,
    catalog: Arc<dyn ResourceCatalog>,
}

impl DownloadGate {
    pub fn new(orders: OrderBook, catalog: Arc<dyn ResourceCatalog>) -> Self {
        Self { orders, catalog }
    }

    /// Read-only. The file itself is only checked for existence here; a file
    /// vanishing between this check and the transfer is a `ResourceNotFound`
    /// at serve time.
    pub async fn authorize(
        &self,
        resource_ref: ResourceRef,
        email: &str,
        tracking_id: &str,
    ) -> Result<FileHandle, PaymentError> {
        let resource = self
            .catalog
            .find(resource_ref)
            .await
            .ok_or(PaymentError::ResourceNotFound(resource_ref))?;

        let email = normalize_email(email);
        let record = self
            .orders
            .get(tracking_id.trim())
            .await?
            .filter(|r| r.resource_ref == resource_ref && r.requester_email == email)
            .ok_or_else(|| {
                warn!(resource_ref, tracking_id, "download denied: no matching order");
                PaymentError::Forbidden(DenyReason::NoRecord)
            })?;

        if record.status != OrderStatus::Completed {
            info!(
                resource_ref,
                tracking_id,
                status = %record.status,
                "download denied: payment not completed"
            );
            return Err(PaymentError::Forbidden(DenyReason::NotCompleted(
                record.status,
            )));
        }

        if !tokio::fs::try_exists(&resource.file).await.unwrap_or(false) {
            warn!(resource_ref, path = %resource.file.display(), "resource file missing");
            return Err(PaymentError::ResourceNotFound(resource_ref));
        }

        let file_name = resource
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("resource-{}", resource.id));

        Ok(FileHandle {
            path: resource.file,
            file_name,
            title: resource.title,
        })
    }
}

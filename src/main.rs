use axum::http::{header, HeaderValue, Method};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod audit;
mod catalog;
mod config;
mod download;
mod error;
mod handlers;
mod initiator;
mod orders;
mod pesapal;
mod reconcile;
mod redis_store;
#[cfg(test)]
mod testing;

use audit::AuditLog;
use catalog::FileCatalog;
use config::AppConfig;
use download::DownloadGate;
use handlers::{create_router, AppState};
use initiator::PaymentInitiator;
use orders::{InMemoryOrderStore, OrderBook, OrderStore};
use pesapal::{PaymentGateway, PesapalClient};
use reconcile::ReconciliationEngine;
use redis_store::RedisOrderStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if available
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookpay=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn OrderStore> = match &config.redis_url {
        Some(url) => {
            info!("using redis order store");
            Arc::new(RedisOrderStore::new(url)?)
        }
        None => {
            warn!("REDIS_URL not set, orders are kept in memory only");
            Arc::new(InMemoryOrderStore::new())
        }
    };
    let orders = OrderBook::new(store);

    let catalog = Arc::new(FileCatalog::load(&config.resources_dir)?);
    info!(
        resources = catalog.len(),
        dir = %config.resources_dir.display(),
        "resource catalog loaded"
    );

    let audit = match &config.audit_log_path {
        Some(path) => AuditLog::open(path).await?,
        None => AuditLog::in_memory(),
    };

    let gateway: Option<Arc<dyn PaymentGateway>> = match config.pesapal.clone() {
        Some(pesapal) => {
            if pesapal.ipn_id.is_empty() {
                warn!("PESAPAL_IPN_ID not set, the gateway will not deliver notifications");
            }
            let client = PesapalClient::new(pesapal)?;
            // Surface bad credentials at startup; requests retry on their own.
            if let Err(e) = client.tokens().get_access_token().await {
                warn!(error = %e, "initial gateway authentication failed");
            }
            Some(Arc::new(client))
        }
        None => {
            warn!("PesaPal credentials not configured, running in offline mode");
            None
        }
    };

    let state = Arc::new(AppState {
        orders: orders.clone(),
        initiator: PaymentInitiator::new(
            orders.clone(),
            catalog.clone(),
            gateway.clone(),
            audit.clone(),
            config.currency.clone(),
            config.download_success_url.clone(),
        ),
        engine: ReconciliationEngine::new(orders.clone(), gateway, audit),
        gate: DownloadGate::new(orders, catalog),
    });

    let cors = match &config.allowed_origin {
        Some(origin) => CorsLayer::new().allow_origin(origin.parse::<HeaderValue>()?),
        None => CorsLayer::new().allow_origin(Any),
    }
    .allow_methods([Method::GET, Method::POST])
    .allow_headers([header::CONTENT_TYPE]);

    let app = create_router(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "server listening");
    info!("   - Purchase:     http://{}/api/pay", addr);
    info!("   - PesaPal IPN:  http://{}/api/pesapal/ipn", addr);
    info!("   - Health Check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining connections");
}

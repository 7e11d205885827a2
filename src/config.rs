// bookpay/src/config.rs
// Environment-driven configuration for the storefront payment service

use std::path::PathBuf;
use std::time::Duration;

const SANDBOX_BASE_URL: &str = "https://cybqa.pesapal.com/pesapalv3";
const LIVE_BASE_URL: &str = "https://pay.pesapal.com/v3";

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PESAPAL CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct PesapalConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub base_url: String,
    pub ipn_id: String,
    pub callback_url: String,
    pub cancellation_url: Option<String>,
    pub timeout: Duration,
}

// Keep the secret out of logs.
impl std::fmt::Debug for PesapalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PesapalConfig")
            .field("base_url", &self.base_url)
            .field("ipn_id", &self.ipn_id)
            .field("callback_url", &self.callback_url)
            .field("cancellation_url", &self.cancellation_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PesapalConfig {
    /// Returns `None` when either credential is missing or blank, which puts
    /// the service into offline mode.
    fn from_env(timeout: Duration) -> Option<Self> {
        let consumer_key = non_empty_var("PESAPAL_CONSUMER_KEY")?;
        let consumer_secret = non_empty_var("PESAPAL_CONSUMER_SECRET")?;

        let mode = std::env::var("PESAPAL_ENV").unwrap_or_else(|_| "sandbox".to_string());
        let base_url = non_empty_var("PESAPAL_BASE_URL").unwrap_or_else(|| {
            if mode == "live" {
                LIVE_BASE_URL.to_string()
            } else {
                SANDBOX_BASE_URL.to_string()
            }
        });

        Some(Self {
            consumer_key,
            consumer_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
            ipn_id: std::env::var("PESAPAL_IPN_ID").unwrap_or_default(),
            callback_url: std::env::var("PESAPAL_CALLBACK_URL")
                .unwrap_or_else(|_| "http://localhost:3000/download-success.html".to_string()),
            cancellation_url: non_empty_var("PESAPAL_CANCELLATION_URL"),
            timeout,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// APPLICATION CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub pesapal: Option<PesapalConfig>,
    pub currency: String,
    pub redis_url: Option<String>,
    pub resources_dir: PathBuf,
    pub audit_log_path: Option<PathBuf>,
    pub download_success_url: String,
    pub allowed_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 3000u16)?;
        let timeout = Duration::from_secs(parse_var("GATEWAY_TIMEOUT_SECS", 30u64)?);

        Ok(Self {
            port,
            pesapal: PesapalConfig::from_env(timeout),
            currency: std::env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "KES".to_string()),
            redis_url: non_empty_var("REDIS_URL"),
            resources_dir: std::env::var("RESOURCES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./resources")),
            audit_log_path: non_empty_var("AUDIT_LOG_PATH").map(PathBuf::from),
            download_success_url: std::env::var("DOWNLOAD_SUCCESS_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}/download-success.html", port)),
            allowed_origin: non_empty_var("ALLOWED_ORIGIN"),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError {
            key,
            reason: format!("{:?}: {}", raw, e),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_and_rejects_garbage() {
        std::env::remove_var("BOOKPAY_TEST_UNSET");
        assert_eq!(parse_var("BOOKPAY_TEST_UNSET", 42u16).unwrap(), 42);

        std::env::set_var("BOOKPAY_TEST_BAD_PORT", "eighty");
        let err = parse_var("BOOKPAY_TEST_BAD_PORT", 3000u16).unwrap_err();
        assert_eq!(err.key, "BOOKPAY_TEST_BAD_PORT");
        std::env::remove_var("BOOKPAY_TEST_BAD_PORT");
    }

    #[test]
    fn debug_output_omits_credentials() {
        let config = PesapalConfig {
            consumer_key: "ck_live_123".into(),
            consumer_secret: "cs_live_456".into(),
            base_url: SANDBOX_BASE_URL.into(),
            ipn_id: "ipn".into(),
            callback_url: "http://localhost/cb".into(),
            cancellation_url: None,
            timeout: Duration::from_secs(30),
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("ck_live_123"));
        assert!(!rendered.contains("cs_live_456"));
    }
}

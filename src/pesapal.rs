// bookpay/src/pesapal.rs
// PesaPal v3 client: bearer token cache, order submission, transaction status

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PesapalConfig;
use crate::error::{GatewayAuthError, GatewayError};

const TOKEN_PATH: &str = "/api/Auth/RequestToken";
const SUBMIT_ORDER_PATH: &str = "/api/Transactions/SubmitOrderRequest";
const STATUS_PATH: &str = "/api/Transactions/GetTransactionStatus";

/// PesaPal tokens live for five minutes; used when the response has no
/// parsable expiry.
const DEFAULT_TOKEN_TTL_SECS: i64 = 300;
const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;

// ═══════════════════════════════════════════════════════════════════════════════
// GATEWAY CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Billing {
    pub email: String,
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
}

/// What the initiator asks the gateway to charge.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSubmission {
    pub tracking_id: String,
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub billing: Billing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub gateway_order_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionStatus {
    pub status: String,
    pub confirmation_code: Option<String>,
    pub payment_method: Option<String>,
    pub merchant_reference: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn submit_order(&self, order: &OrderSubmission) -> Result<SubmittedOrder, GatewayError>;

    async fn query_status(&self, gateway_order_id: &str)
        -> Result<TransactionStatus, GatewayError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct TokenRequest<'a> {
    consumer_key: &'a str,
    consumer_secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: Option<String>,
    expiry_date: Option<String>,
    error: Option<serde_json::Value>,
    status: Option<String>,
}

#[derive(Serialize)]
struct BillingAddress<'a> {
    email_address: &'a str,
    phone_number: &'a str,
    first_name: &'a str,
    last_name: &'a str,
}

#[derive(Serialize)]
struct SubmitOrderRequest<'a> {
    id: &'a str,
    currency: &'a str,
    amount: f64,
    description: &'a str,
    callback_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancellation_url: Option<&'a str>,
    notification_id: &'a str,
    billing_address: BillingAddress<'a>,
}

#[derive(Deserialize)]
struct SubmitOrderResponse {
    order_tracking_id: Option<String>,
    redirect_url: Option<String>,
    error: Option<serde_json::Value>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    payment_status_description: Option<String>,
    confirmation_code: Option<String>,
    payment_method: Option<String>,
    merchant_reference: Option<String>,
    error: Option<serde_json::Value>,
    status: Option<String>,
}

/// PesaPal reports some failures as HTTP 200 with an `error` object, and
/// fills `error` with an object of nulls on success.
fn embedded_error(
    error: Option<serde_json::Value>,
    status: Option<&str>,
    http_status: u16,
) -> Option<(u16, String)> {
    let error = error.filter(|e| match e {
        serde_json::Value::Null => false,
        serde_json::Value::Object(fields) => fields.values().any(|v| !v.is_null()),
        _ => true,
    })?;
    let status = status
        .and_then(|s| s.parse().ok())
        .unwrap_or(http_status);
    Some((status, error.to_string()))
}

fn auth_transport(err: reqwest::Error) -> GatewayAuthError {
    if err.is_timeout() {
        GatewayAuthError::Timeout
    } else {
        GatewayAuthError::Connection(err.to_string())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKEN PROVIDER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct TokenProvider {
    http_client: Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    cached: Arc<RwLock<Option<(String, DateTime<Utc>)>>>,
}

impl TokenProvider {
    pub fn new(http_client: Client, config: &PesapalConfig) -> Self {
        Self {
            http_client,
            base_url: config.base_url.clone(),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Get valid access token (cached or refreshed)
    pub async fn get_access_token(&self) -> Result<String, GatewayAuthError> {
        {
            let cached = self.cached.read().await;
            if let Some((token, expiry)) = &*cached {
                if *expiry > Utc::now() {
                    return Ok(token.clone());
                }
            }
        }

        let (token, expiry) = self.request_token().await?;

        let mut cached = self.cached.write().await;
        *cached = Some((token.clone(), expiry));
        Ok(token)
    }

    /// Drops the cached token after the gateway refused it.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn request_token(&self) -> Result<(String, DateTime<Utc>), GatewayAuthError> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let resp = self
            .http_client
            .post(&url)
            .header("Accept", "application/json")
            .json(&TokenRequest {
                consumer_key: &self.consumer_key,
                consumer_secret: &self.consumer_secret,
            })
            .send()
            .await
            .map_err(auth_transport)?;

        let http_status = resp.status();
        let body = resp.text().await.map_err(auth_transport)?;

        if !http_status.is_success() {
            return Err(GatewayAuthError::Rejected {
                status: http_status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayAuthError::MalformedResponse(e.to_string()))?;

        if let Some((status, body)) =
            embedded_error(parsed.error, parsed.status.as_deref(), http_status.as_u16())
        {
            return Err(GatewayAuthError::Rejected { status, body });
        }

        let token = non_empty(parsed.token).ok_or(GatewayAuthError::MissingToken)?;
        let expiry = parsed
            .expiry_date
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_TOKEN_TTL_SECS))
            - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS);

        debug!(expires_at = %expiry, "obtained gateway access token");
        Ok((token, expiry))
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, token: &str, expiry: DateTime<Utc>) {
        *self.cached.write().await = Some((token.to_string(), expiry));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PESAPAL CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct PesapalClient {
    config: PesapalConfig,
    http_client: Client,
    tokens: TokenProvider,
}

impl PesapalClient {
    pub fn new(config: PesapalConfig) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("http client setup: {}", e)))?;
        let tokens = TokenProvider::new(http_client.clone(), &config);
        Ok(Self {
            config,
            http_client,
            tokens,
        })
    }

    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    /// Sends a bearer-authenticated request, refreshing the token once if the
    /// gateway answers 401.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, GatewayError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.tokens.get_access_token().await?;
        let resp = build(&token)
            .send()
            .await
            .map_err(GatewayError::from_transport)?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        warn!("gateway refused cached token, fetching a new one");
        self.tokens.invalidate().await;
        let token = self.tokens.get_access_token().await?;
        build(&token)
            .send()
            .await
            .map_err(GatewayError::from_transport)
    }

    async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<(u16, T), GatewayError> {
        let status = resp.status();
        let body = resp.text().await.map_err(GatewayError::from_transport)?;
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let parsed =
            serde_json::from_str(&body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        Ok((status.as_u16(), parsed))
    }
}

#[async_trait]
impl PaymentGateway for PesapalClient {
    async fn submit_order(&self, order: &OrderSubmission) -> Result<SubmittedOrder, GatewayError> {
        let url = format!("{}{}", self.config.base_url, SUBMIT_ORDER_PATH);
        let request = SubmitOrderRequest {
            id: &order.tracking_id,
            currency: &order.currency,
            amount: order.amount,
            description: &order.description,
            callback_url: &self.config.callback_url,
            cancellation_url: self.config.cancellation_url.as_deref(),
            notification_id: &self.config.ipn_id,
            billing_address: BillingAddress {
                email_address: &order.billing.email,
                phone_number: &order.billing.phone,
                first_name: &order.billing.first_name,
                last_name: &order.billing.last_name,
            },
        };

        let resp = self
            .send_authorized(|token| {
                self.http_client
                    .post(&url)
                    .bearer_auth(token)
                    .header("Accept", "application/json")
                    .json(&request)
            })
            .await?;
        let (http_status, parsed): (u16, SubmitOrderResponse) = Self::read_json(resp).await?;

        if let Some((status, body)) =
            embedded_error(parsed.error, parsed.status.as_deref(), http_status)
        {
            return Err(GatewayError::Rejected { status, body });
        }

        let gateway_order_id = non_empty(parsed.order_tracking_id)
            .ok_or_else(|| GatewayError::Malformed("missing order_tracking_id".to_string()))?;
        let redirect_url = non_empty(parsed.redirect_url)
            .ok_or_else(|| GatewayError::Malformed("missing redirect_url".to_string()))?;

        info!(
            tracking_id = %order.tracking_id,
            gateway_order_id = %gateway_order_id,
            "gateway accepted order"
        );
        Ok(SubmittedOrder {
            gateway_order_id,
            redirect_url,
        })
    }

    async fn query_status(
        &self,
        gateway_order_id: &str,
    ) -> Result<TransactionStatus, GatewayError> {
        let url = format!("{}{}", self.config.base_url, STATUS_PATH);
        let resp = self
            .send_authorized(|token| {
                self.http_client
                    .get(&url)
                    .query(&[("orderTrackingId", gateway_order_id)])
                    .bearer_auth(token)
                    .header("Accept", "application/json")
            })
            .await?;
        let (http_status, parsed): (u16, StatusResponse) = Self::read_json(resp).await?;
        let error = embedded_error(parsed.error, parsed.status.as_deref(), http_status);

        // Failed and INVALID payments come back with a filled `error` object
        // next to the description. The description is the answer; the error
        // only explains it.
        let status = match (non_empty(parsed.payment_status_description), error) {
            (Some(status), Some((code, detail))) => {
                debug!(
                    gateway_order_id,
                    status = %status,
                    code,
                    detail = %detail,
                    "gateway attached an error to the status report"
                );
                status
            }
            (Some(status), None) => status,
            (None, Some((status, body))) => return Err(GatewayError::Rejected { status, body }),
            (None, None) => {
                return Err(GatewayError::Malformed(
                    "missing payment_status_description".to_string(),
                ))
            }
        };

        Ok(TransactionStatus {
            status,
            confirmation_code: non_empty(parsed.confirmation_code),
            payment_method: non_empty(parsed.payment_method),
            merchant_reference: non_empty(parsed.merchant_reference),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn config(base_url: String) -> PesapalConfig {
        PesapalConfig {
            consumer_key: "ck_test".into(),
            consumer_secret: "cs_test".into(),
            base_url,
            ipn_id: "ipn-123".into(),
            callback_url: "http://localhost:3000/download-success.html".into(),
            cancellation_url: None,
            timeout: std::time::Duration::from_secs(5),
        }
    }

    fn submission() -> OrderSubmission {
        OrderSubmission {
            tracking_id: "BK-1".into(),
            amount: 100.0,
            currency: "KES".into(),
            description: "Payment for Form 1 Biology".into(),
            billing: Billing {
                email: "a@x.com".into(),
                phone: "+254700000000".into(),
                first_name: "Test".into(),
                last_name: "User".into(),
            },
        }
    }

    fn token_body(token: &str) -> String {
        json!({
            "token": token,
            "expiryDate": (Utc::now() + Duration::minutes(5)).to_rfc3339(),
            "error": null,
            "status": "200",
            "message": "Request processed successfully"
        })
        .to_string()
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::PartialJson(json!({
                "consumer_key": "ck_test",
                "consumer_secret": "cs_test"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("tok-1"))
            .expect(1)
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        assert_eq!(client.tokens().get_access_token().await.unwrap(), "tok-1");
        assert_eq!(client.tokens().get_access_token().await.unwrap(), "tok-1");
        auth.assert_async().await;
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-new"))
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        client
            .tokens()
            .seed("tok-old", Utc::now() - Duration::seconds(1))
            .await;
        assert_eq!(client.tokens().get_access_token().await.unwrap(), "tok-new");
    }

    #[tokio::test]
    async fn auth_failures_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let client = PesapalClient::new(config(server.url())).unwrap();

        let rejected = server
            .mock("POST", TOKEN_PATH)
            .with_status(401)
            .with_body("invalid consumer key")
            .create_async()
            .await;
        let err = client.tokens().get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayAuthError::Rejected { status: 401, .. }));
        rejected.remove_async().await;

        let missing = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(r#"{"token":null,"expiryDate":null,"error":null,"status":"200"}"#)
            .create_async()
            .await;
        let err = client.tokens().get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayAuthError::MissingToken));
        missing.remove_async().await;

        let embedded = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(
                r#"{"token":null,"error":{"code":"invalid_consumer_key_or_secret_provided"},"status":"500"}"#,
            )
            .create_async()
            .await;
        let err = client.tokens().get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayAuthError::Rejected { status: 500, .. }));
        embedded.remove_async().await;

        let _garbage = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;
        let err = client.tokens().get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayAuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_connection_error() {
        // Bind then drop so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = PesapalClient::new(config(format!("http://127.0.0.1:{}", port))).unwrap();
        let err = client.tokens().get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayAuthError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn silent_gateway_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let mut cfg = config(format!("http://{}", addr));
        cfg.timeout = std::time::Duration::from_millis(200);
        let client = PesapalClient::new(cfg).unwrap();

        let err = client.tokens().get_access_token().await.unwrap_err();
        assert!(matches!(err, GatewayAuthError::Timeout));
    }

    #[tokio::test]
    async fn submit_order_sends_tracking_id_as_reference() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-1"))
            .create_async()
            .await;
        let submit = server
            .mock("POST", SUBMIT_ORDER_PATH)
            .match_header("authorization", "Bearer tok-1")
            .match_body(Matcher::PartialJson(json!({
                "id": "BK-1",
                "currency": "KES",
                "amount": 100.0,
                "notification_id": "ipn-123",
                "callback_url": "http://localhost:3000/download-success.html",
                "billing_address": { "email_address": "a@x.com", "first_name": "Test" }
            })))
            .with_status(200)
            .with_body(
                json!({
                    "order_tracking_id": "b945e4af-80a5-4ec1-8706-e03f8332fb04",
                    "merchant_reference": "BK-1",
                    "redirect_url": "https://cybqa.pesapal.com/pesapaliframe/PesapalIframe3/Index?OrderTrackingId=b945e4af",
                    "error": null,
                    "status": "200"
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        let submitted = client.submit_order(&submission()).await.unwrap();
        assert_eq!(
            submitted.gateway_order_id,
            "b945e4af-80a5-4ec1-8706-e03f8332fb04"
        );
        assert!(submitted.redirect_url.contains("OrderTrackingId"));
        submit.assert_async().await;
    }

    #[tokio::test]
    async fn submit_order_without_redirect_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-1"))
            .create_async()
            .await;
        let _submit = server
            .mock("POST", SUBMIT_ORDER_PATH)
            .with_status(200)
            .with_body(r#"{"order_tracking_id":"gw-1","redirect_url":null,"error":null,"status":"200"}"#)
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        let err = client.submit_order(&submission()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Malformed(_)));
    }

    #[tokio::test]
    async fn submit_order_surfaces_gateway_error_body() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-1"))
            .create_async()
            .await;
        let _submit = server
            .mock("POST", SUBMIT_ORDER_PATH)
            .with_status(400)
            .with_body(r#"{"error":{"code":"invalid_notification_id"}}"#)
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        match client.submit_order(&submission()).await.unwrap_err() {
            GatewayError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_notification_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_token_is_refreshed_once() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-fresh"))
            .expect(1)
            .create_async()
            .await;
        let stale = server
            .mock("POST", SUBMIT_ORDER_PATH)
            .match_header("authorization", "Bearer tok-stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("POST", SUBMIT_ORDER_PATH)
            .match_header("authorization", "Bearer tok-fresh")
            .with_status(200)
            .with_body(r#"{"order_tracking_id":"gw-9","redirect_url":"https://pay.example/gw-9","error":null,"status":"200"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        client
            .tokens()
            .seed("tok-stale", Utc::now() + Duration::minutes(5))
            .await;

        let submitted = client.submit_order(&submission()).await.unwrap();
        assert_eq!(submitted.gateway_order_id, "gw-9");
        auth.assert_async().await;
        stale.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn query_status_reads_description_and_confirmation() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-1"))
            .create_async()
            .await;
        let _status = server
            .mock("GET", STATUS_PATH)
            .match_query(Matcher::UrlEncoded("orderTrackingId".into(), "gw-1".into()))
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(
                json!({
                    "payment_method": "Visa",
                    "amount": 100,
                    "confirmation_code": "6513008693186320103009",
                    "payment_status_description": "Completed",
                    "status_code": 1,
                    "merchant_reference": "BK-1",
                    "currency": "KES",
                    "error": { "error_type": null, "code": null, "message": null },
                    "status": "200"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        let status = client.query_status("gw-1").await.unwrap();
        assert_eq!(status.status, "Completed");
        assert_eq!(
            status.confirmation_code.as_deref(),
            Some("6513008693186320103009")
        );
        assert_eq!(status.payment_method.as_deref(), Some("Visa"));
        assert_eq!(status.merchant_reference.as_deref(), Some("BK-1"));
    }

    #[tokio::test]
    async fn query_status_without_description_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-1"))
            .create_async()
            .await;
        let _status = server
            .mock("GET", STATUS_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"payment_status_description":"","error":null,"status":"200"}"#)
            .create_async()
            .await;

        let client = PesapalClient::new(config(server.url())).unwrap();
        let err = client.query_status("gw-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Malformed(_)));
    }

    async fn status_client(
        body: serde_json::Value,
    ) -> (mockito::ServerGuard, [mockito::Mock; 2], PesapalClient) {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_body(token_body("tok-1"))
            .create_async()
            .await;
        let status = server
            .mock("GET", STATUS_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;
        let client = PesapalClient::new(config(server.url())).unwrap();
        (server, [auth, status], client)
    }

    #[tokio::test]
    async fn failed_payment_report_is_a_status_not_an_error() {
        let (_server, _mocks, client) = status_client(json!({
            "payment_method": "Visa",
            "amount": 100,
            "created_date": "2022-04-30T07:41:09.763",
            "confirmation_code": "",
            "payment_status_description": "Failed",
            "description": "Unable to Authorize Transaction.Kindly contact your bank for assistance",
            "message": "Request processed successfully",
            "payment_account": "476173**0010",
            "call_back_url": "https://test.com/?OrderTrackingId=gw-1&OrderMerchantReference=BK-1",
            "status_code": 2,
            "merchant_reference": "BK-1",
            "payment_status_code": "",
            "currency": "KES",
            "error": {
                "error_type": "api_error",
                "code": "payment_details_not_found",
                "message": "Unable to Authorize Transaction.Kindly contact your bank for assistance",
                "call_back_url": "https://test.com/?OrderTrackingId=gw-1&OrderMerchantReference=BK-1"
            },
            "status": "500"
        }))
        .await;

        let status = client.query_status("gw-1").await.unwrap();
        assert_eq!(status.status, "Failed");
        assert_eq!(status.confirmation_code, None);
        assert_eq!(status.merchant_reference.as_deref(), Some("BK-1"));
    }

    #[tokio::test]
    async fn invalid_payment_report_is_returned_as_is() {
        let (_server, _mocks, client) = status_client(json!({
            "payment_method": null,
            "amount": 100,
            "confirmation_code": null,
            "payment_status_description": "INVALID",
            "status_code": 0,
            "merchant_reference": "BK-1",
            "currency": "KES",
            "error": {
                "error_type": "api_error",
                "code": "payment_details_not_found",
                "message": "Pending Payment"
            },
            "status": "500"
        }))
        .await;

        let status = client.query_status("gw-1").await.unwrap();
        assert_eq!(status.status, "INVALID");
        assert_eq!(status.payment_method, None);
    }

    #[tokio::test]
    async fn error_without_description_is_rejected() {
        let (_server, _mocks, client) = status_client(json!({
            "payment_status_description": null,
            "error": {
                "error_type": "api_error",
                "code": "invalid_order_tracking_id",
                "message": "Order tracking id is invalid"
            },
            "status": "400"
        }))
        .await;

        let err = client.query_status("gw-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
    }
}

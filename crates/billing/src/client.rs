//! PayPal gateway client
//!
//! Thin I/O wrapper over the PayPal REST API: order creation, capture,
//! provider-side subscription cancellation, and webhook signature
//! verification. Carries no billing state of its own.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;
use truevault_shared::clock::utc_now;

type HmacSha256 = Hmac<Sha256>;

/// Remote-call timeout shared by every outbound request in this core.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the PayPal integration
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub secret: String,
    /// API base, e.g. `https://api-m.paypal.com` or the sandbox host.
    pub api_base: String,
    /// Shared secret for webhook HMAC verification.
    pub webhook_secret: String,
    /// Base URL for the return/cancel redirects shown after approval.
    pub app_base_url: String,
    pub brand_name: String,
}

impl PayPalConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let mode = std::env::var("PAYPAL_MODE").unwrap_or_else(|_| "live".to_string());
        let default_base = if mode == "sandbox" {
            "https://api-m.sandbox.paypal.com"
        } else {
            "https://api-m.paypal.com"
        };
        Ok(Self {
            client_id: std::env::var("PAYPAL_CLIENT_ID")
                .map_err(|_| BillingError::Config("PAYPAL_CLIENT_ID not set".to_string()))?,
            secret: std::env::var("PAYPAL_SECRET")
                .map_err(|_| BillingError::Config("PAYPAL_SECRET not set".to_string()))?,
            api_base: std::env::var("PAYPAL_API_URL").unwrap_or_else(|_| default_base.to_string()),
            webhook_secret: std::env::var("PAYPAL_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("PAYPAL_WEBHOOK_SECRET not set".to_string()))?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            brand_name: "TrueVault VPN".to_string(),
        })
    }
}

/// A created order awaiting user approval.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedOrder {
    pub order_id: String,
    pub approval_url: Option<String>,
}

/// Outcome of a capture attempt.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub completed: bool,
    pub provider_status: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

/// PayPal billing client
#[derive(Clone)]
pub struct PayPalClient {
    http: reqwest::Client,
    config: PayPalConfig,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl PayPalClient {
    pub fn new(config: PayPalConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(PayPalConfig::from_env()?))
    }

    pub fn config(&self) -> &PayPalConfig {
        &self.config
    }

    /// OAuth2 client-credentials token, cached until shortly before expiry.
    async fn access_token(&self) -> BillingResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > utc_now() {
                return Ok(token.access_token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.secret))
            .header("Accept", "application/json")
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BillingError::Gateway(format!(
                "token request failed with status {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("malformed token response: {e}")))?;

        let token = CachedToken {
            access_token: body.access_token.clone(),
            // Refresh a minute early rather than racing the expiry.
            expires_at: utc_now() + time::Duration::seconds(body.expires_in - 60),
        };
        *cached = Some(token);
        Ok(body.access_token)
    }

    /// Create a checkout order for a plan.
    ///
    /// The `custom_id` envelope travels with every later webhook for this
    /// payment and is the only link back to the user when the provider omits
    /// our order id.
    pub async fn create_order(
        &self,
        user_id: i64,
        email: &str,
        plan: &Plan,
    ) -> BillingResult<CreatedOrder> {
        let token = self.access_token().await?;

        let custom_id = serde_json::to_string(&json!({
            "user_id": user_id,
            "plan_id": plan.id,
            "email": email,
        }))
        .map_err(|e| BillingError::Gateway(e.to_string()))?;

        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": format!("truevault_{}_{}_{}", user_id, plan.id, utc_now().unix_timestamp()),
                "description": format!("{} - {} Plan", self.config.brand_name, plan.name),
                "amount": {
                    "currency_code": "USD",
                    "value": plan.price_usd(),
                },
                "custom_id": custom_id,
            }],
            "application_context": {
                "brand_name": self.config.brand_name,
                "landing_page": "NO_PREFERENCE",
                "user_action": "PAY_NOW",
                "return_url": format!("{}/payment-success.html", self.config.app_base_url),
                "cancel_url": format!("{}/payment-cancel.html", self.config.app_base_url),
            },
        });

        let response = self
            .http
            .post(format!("{}/v2/checkout/orders", self.config.api_base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Gateway(format!(
                "order creation failed with status {status}"
            )));
        }

        #[derive(Deserialize)]
        struct OrderLink {
            rel: String,
            href: String,
        }
        #[derive(Deserialize)]
        struct OrderResponse {
            id: String,
            #[serde(default)]
            links: Vec<OrderLink>,
        }

        let order: OrderResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("malformed order response: {e}")))?;

        let approval_url = order
            .links
            .into_iter()
            .find(|l| l.rel == "approve")
            .map(|l| l.href);

        tracing::info!(
            order_id = %order.id,
            user_id = user_id,
            plan_id = %plan.id,
            "Created PayPal order"
        );

        Ok(CreatedOrder {
            order_id: order.id,
            approval_url,
        })
    }

    /// Capture an approved order.
    pub async fn capture_order(&self, order_id: &str) -> BillingResult<CaptureOutcome> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(format!(
                "{}/v2/checkout/orders/{}/capture",
                self.config.api_base, order_id
            ))
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::Gateway(format!(
                "capture failed with status {status}"
            )));
        }

        #[derive(Deserialize)]
        struct CaptureResponse {
            #[serde(default)]
            status: String,
        }

        let body: CaptureResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Gateway(format!("malformed capture response: {e}")))?;

        Ok(CaptureOutcome {
            completed: body.status == "COMPLETED",
            provider_status: body.status,
        })
    }

    /// Cancel a provider-side billing agreement.
    pub async fn cancel_provider_subscription(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> BillingResult<()> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(format!(
                "{}/v1/billing/subscriptions/{}/cancel",
                self.config.api_base, subscription_id
            ))
            .bearer_auth(token)
            .json(&json!({ "reason": reason }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BillingError::Gateway(format!(
                "subscription cancel failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Verify a webhook's HMAC signature.
    ///
    /// The signed message is `transmission_id|transmission_time|body`; the
    /// comparison runs in constant time. Unverified events must never reach
    /// the ledger.
    pub fn verify_webhook_signature(
        &self,
        transmission_id: &str,
        transmission_time: &str,
        signature_hex: &str,
        body: &str,
    ) -> BillingResult<()> {
        let mut mac = HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(transmission_id.as_bytes());
        mac.update(b"|");
        mac.update(transmission_time.as_bytes());
        mac.update(b"|");
        mac.update(body.as_bytes());

        let provided = hex::decode(signature_hex).map_err(|_| BillingError::SignatureInvalid)?;
        mac.verify_slice(&provided)
            .map_err(|_| BillingError::SignatureInvalid)
    }

    /// Compute the signature for a payload; used by tests and by operator
    /// tooling that replays logged events.
    pub fn sign_webhook(
        &self,
        transmission_id: &str,
        transmission_time: &str,
        body: &str,
    ) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(transmission_id.as_bytes());
        mac.update(b"|");
        mac.update(transmission_time.as_bytes());
        mac.update(b"|");
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(api_base: &str) -> PayPalConfig {
        PayPalConfig {
            client_id: "client".to_string(),
            secret: "secret".to_string(),
            api_base: api_base.to_string(),
            webhook_secret: "whsec_test".to_string(),
            app_base_url: "https://vpn.example.com".to_string(),
            brand_name: "TrueVault VPN".to_string(),
        }
    }

    #[test]
    fn signature_roundtrip_and_rejection() {
        let client = PayPalClient::new(test_config("http://unused"));
        let body = r#"{"event_type":"PAYMENT.CAPTURE.COMPLETED"}"#;
        let sig = client.sign_webhook("wh-1", "2026-01-01T00:00:00Z", body).unwrap();

        assert!(client
            .verify_webhook_signature("wh-1", "2026-01-01T00:00:00Z", &sig, body)
            .is_ok());

        // Any tampering with the signed fields must fail.
        assert!(client
            .verify_webhook_signature("wh-2", "2026-01-01T00:00:00Z", &sig, body)
            .is_err());
        assert!(client
            .verify_webhook_signature("wh-1", "2026-01-01T00:00:00Z", &sig, "{}")
            .is_err());
        assert!(client
            .verify_webhook_signature("wh-1", "2026-01-01T00:00:00Z", "zz-not-hex", body)
            .is_err());
    }

    #[tokio::test]
    async fn create_order_returns_approval_url() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"tok","expires_in":3600}"#)
            .create_async()
            .await;
        let _order = server
            .mock("POST", "/v2/checkout/orders")
            .with_status(201)
            .with_body(
                r#"{"id":"ORDER-1","links":[{"rel":"self","href":"x"},{"rel":"approve","href":"https://paypal.test/approve/ORDER-1"}]}"#,
            )
            .create_async()
            .await;

        let client = PayPalClient::new(test_config(&server.url()));
        let plan = crate::plans::PlanCatalog::standard()
            .require("family")
            .unwrap()
            .clone();
        let created = client.create_order(7, "user@example.com", &plan).await.unwrap();
        assert_eq!(created.order_id, "ORDER-1");
        assert_eq!(
            created.approval_url.as_deref(),
            Some("https://paypal.test/approve/ORDER-1")
        );
    }

    #[tokio::test]
    async fn capture_reports_non_completed_status() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"tok","expires_in":3600}"#)
            .create_async()
            .await;
        let _capture = server
            .mock("POST", "/v2/checkout/orders/ORDER-9/capture")
            .with_status(201)
            .with_body(r#"{"status":"DECLINED"}"#)
            .create_async()
            .await;

        let client = PayPalClient::new(test_config(&server.url()));
        let outcome = client.capture_order("ORDER-9").await.unwrap();
        assert!(!outcome.completed);
        assert_eq!(outcome.provider_status, "DECLINED");
    }
}

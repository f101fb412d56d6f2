//! Payment gateway client and signature verification
//!
//! Thin REST client for the payment gateway (order creation, payment
//! lookup, refunds) plus the HMAC-SHA256 signature checks for payment
//! callbacks and webhooks.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Configuration for the payment gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway API key id (basic auth username)
    pub key_id: String,
    /// Gateway API secret; also the HMAC key for payment signatures
    pub key_secret: String,
    /// Separate signing secret for webhook payloads
    pub webhook_secret: String,
    /// Gateway API base URL
    pub base_url: String,
    /// Per-request timeout. A timed-out call is treated as a retryable
    /// failure by the caller; reconciliation re-queries stale orders.
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            key_id: std::env::var("GATEWAY_KEY_ID")
                .map_err(|_| BillingError::Config("GATEWAY_KEY_ID not set".to_string()))?,
            key_secret: std::env::var("GATEWAY_KEY_SECRET")
                .map_err(|_| BillingError::Config("GATEWAY_KEY_SECRET not set".to_string()))?,
            webhook_secret: std::env::var("GATEWAY_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("GATEWAY_WEBHOOK_SECRET not set".to_string()))?,
            base_url: std::env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
            timeout: std::env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
        })
    }
}

/// Request body for gateway order creation (amounts in minor units)
#[derive(Debug, Serialize)]
pub struct CreateGatewayOrder {
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
}

/// Gateway order as returned by the remote API
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub notes: Option<serde_json::Value>,
}

/// Request body for a gateway refund
#[derive(Debug, Serialize)]
pub struct CreateGatewayRefund {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<serde_json::Value>,
}

/// Gateway refund as returned by the remote API
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
}

/// Request body for an off-session recurring charge against a saved
/// payment token
#[derive(Debug, Serialize)]
pub struct CreateRecurringCharge {
    pub amount: i64,
    pub currency: String,
    pub customer_id: String,
    pub token: String,
    pub recurring: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Gateway payment as returned by the recurring charge API
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayment {
    #[serde(rename = "razorpay_payment_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Payment gateway client
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    /// Create a new gateway client from config
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Create a new gateway client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    /// Get the config
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Create a remote order on the gateway
    pub async fn create_order(&self, params: CreateGatewayOrder) -> BillingResult<GatewayOrder> {
        let url = format!("{}/orders", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %body,
                "Gateway order creation failed"
            );
            return Err(BillingError::Gateway(format!(
                "Order creation failed ({}): {}",
                status, body
            )));
        }

        let order: GatewayOrder = response.json().await?;

        tracing::info!(
            gateway_order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            "Created gateway order"
        );

        Ok(order)
    }

    /// Issue a refund for a captured payment
    pub async fn refund_payment(
        &self,
        gateway_payment_id: &str,
        params: CreateGatewayRefund,
    ) -> BillingResult<GatewayRefund> {
        let url = format!(
            "{}/payments/{}/refund",
            self.config.base_url, gateway_payment_id
        );
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                gateway_payment_id = %gateway_payment_id,
                status = %status,
                body = %body,
                "Gateway refund failed"
            );
            return Err(BillingError::Gateway(format!(
                "Refund failed ({}): {}",
                status, body
            )));
        }

        let refund: GatewayRefund = response.json().await?;

        tracing::info!(
            gateway_payment_id = %gateway_payment_id,
            refund_id = %refund.id,
            "Gateway refund issued"
        );

        Ok(refund)
    }

    /// Charge a saved payment token without the customer present. Used
    /// by recurring billing and payment retries.
    pub async fn charge_recurring(
        &self,
        params: CreateRecurringCharge,
    ) -> BillingResult<GatewayPayment> {
        let url = format!("{}/payments/create/recurring", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                customer_id = %params.customer_id,
                status = %status,
                body = %body,
                "Recurring charge failed"
            );
            return Err(BillingError::Gateway(format!(
                "Recurring charge failed ({}): {}",
                status, body
            )));
        }

        let payment: GatewayPayment = response.json().await?;

        tracing::info!(
            gateway_payment_id = %payment.id,
            customer_id = %params.customer_id,
            "Recurring charge captured"
        );

        Ok(payment)
    }

    /// Compute the expected payment callback signature:
    /// HMAC-SHA256(key_secret, "gateway_order_id|gateway_payment_id"), hex.
    pub fn payment_signature(&self, gateway_order_id: &str, gateway_payment_id: &str) -> String {
        sign(
            &self.config.key_secret,
            format!("{}|{}", gateway_order_id, gateway_payment_id).as_bytes(),
        )
    }

    /// Verify a payment callback signature. Comparison is constant-time
    /// via the MAC itself, not string equality.
    pub fn verify_payment_signature(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> BillingResult<()> {
        verify(
            &self.config.key_secret,
            format!("{}|{}", gateway_order_id, gateway_payment_id).as_bytes(),
            signature,
        )
    }

    /// Verify a webhook payload signature against the header-provided
    /// value: HMAC-SHA256(webhook_secret, raw_body). The body must not be
    /// parsed or acted on before this check passes.
    pub fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> BillingResult<()> {
        verify(&self.config.webhook_secret, raw_body, signature)
    }
}

fn sign(secret: &str, message: &[u8]) -> String {
    // HMAC accepts keys of any length; new_from_slice only fails for
    // variable-output MACs, which Hmac<Sha256> is not.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn verify(secret: &str, message: &[u8], signature: &str) -> BillingResult<()> {
    let expected = hex::decode(signature).map_err(|_| {
        tracing::warn!("Signature is not valid hex");
        BillingError::SignatureInvalid
    })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(message);

    mac.verify_slice(&expected).map_err(|_| {
        tracing::warn!("Signature mismatch");
        BillingError::SignatureInvalid
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    fn test_client() -> GatewayClient {
        GatewayClient::new(GatewayConfig {
            key_id: "key_test".to_string(),
            key_secret: "secret_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            base_url: "http://localhost:9999".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn test_payment_signature_round_trip() {
        let client = test_client();
        let sig = client.payment_signature("order_abc", "pay_xyz");
        assert!(client
            .verify_payment_signature("order_abc", "pay_xyz", &sig)
            .is_ok());
    }

    #[test]
    fn test_payment_signature_rejects_tampered_ids() {
        let client = test_client();
        let sig = client.payment_signature("order_abc", "pay_xyz");
        assert!(matches!(
            client.verify_payment_signature("order_abc", "pay_other", &sig),
            Err(BillingError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_webhook_signature_rejects_altered_body() {
        let client = test_client();
        let body = br#"{"payment_id":"pay_1","amount":9900}"#;
        let sig = sign("whsec_test", body);
        assert!(client.verify_webhook_signature(body, &sig).is_ok());

        // Same structure, altered amount: well-formed signature, wrong body
        let tampered = br#"{"payment_id":"pay_1","amount":100}"#;
        assert!(matches!(
            client.verify_webhook_signature(tampered, &sig),
            Err(BillingError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let client = test_client();
        assert!(matches!(
            client.verify_payment_signature("o", "p", "not-hex!"),
            Err(BillingError::SignatureInvalid)
        ));
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::errors::ServiceError;

/// Gateway payment status value that permits marking an order paid.
pub const CAPTURED: &str = "captured";

/// Authoritative payment object fetched from the gateway. Client-supplied
/// amounts and statuses are never trusted; this is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub method: Option<String>,
    /// Amount in minor currency units (paise)
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub bank: Option<String>,
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub vpa: Option<String>,
    /// Free-form key/value notes attached at gateway-order creation; carries
    /// the storefront's correlation ids.
    #[serde(default)]
    pub notes: serde_json::Value,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl GatewayPayment {
    pub fn is_captured(&self) -> bool {
        self.status == CAPTURED
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).and_then(|value| value.as_str())
    }
}

/// Client for the payment gateway's REST API.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetches the authoritative payment object by gateway payment id.
    /// Network failures surface as retryable `ExternalServiceError`s.
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError>;
}

/// Razorpay REST client with basic-auth credentials and a bounded request
/// timeout.
#[derive(Clone)]
pub struct RazorpayClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayClient {
    pub fn new(
        base_url: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client build failed: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
        let url = format!("{}/payments/{}", self.base_url, payment_id);
        debug!(url = %url, "Fetching payment from gateway");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalServiceError(format!("gateway fetch failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "gateway returned {} for payment {}",
                status, payment_id
            )));
        }

        response.json::<GatewayPayment>().await.map_err(|e| {
            ServiceError::SerializationError(format!("gateway payment decode failed: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payment_deserializes_from_gateway_shape() {
        let payload = json!({
            "id": "pay_EAe1AQVI9v7aCX",
            "entity": "payment",
            "order_id": "order_EAe0zssnWg9nRK",
            "status": "captured",
            "method": "upi",
            "amount": 90000,
            "currency": "INR",
            "email": "shopper@example.com",
            "contact": "+919999999999",
            "vpa": "shopper@upi",
            "notes": {"order_id": "4b2a1a89-6ac9-4d2f-9a70-47bb8b3b01ab"}
        });

        let payment: GatewayPayment = serde_json::from_value(payload).unwrap();
        assert!(payment.is_captured());
        assert_eq!(payment.amount, 90000);
        assert_eq!(
            payment.note("order_id"),
            Some("4b2a1a89-6ac9-4d2f-9a70-47bb8b3b01ab")
        );
        assert_eq!(payment.note("missing"), None);
    }

    #[test]
    fn non_captured_status_is_rejected() {
        let payment = GatewayPayment {
            id: "pay_x".into(),
            order_id: None,
            status: "authorized".into(),
            method: None,
            amount: 1000,
            currency: None,
            email: None,
            contact: None,
            bank: None,
            wallet: None,
            vpa: None,
            notes: serde_json::Value::Null,
            error_description: None,
        };
        assert!(!payment.is_captured());
    }
}

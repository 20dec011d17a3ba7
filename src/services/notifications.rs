use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Transactional messages handed to the external notification service.
/// Rendering and delivery happen on the other side; this side only
/// dispatches, and callers treat failures as best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorefrontNotification {
    OrderConfirmation {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        total: String,
    },
    PaymentConfirmation {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        payment_id: String,
    },
}

/// External collaborator that renders and sends transactional email.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver(&self, notification: StorefrontNotification) -> Result<(), ServiceError>;
}

/// Posts notifications to the configured notification service, signing the
/// body when a shared secret is configured.
#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
}

impl HttpNotifier {
    pub fn new(endpoint: String, secret: Option<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client build failed: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            secret,
        })
    }

    fn sign(&self, body: &str) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl NotificationGateway for HttpNotifier {
    #[instrument(skip(self, notification))]
    async fn deliver(&self, notification: StorefrontNotification) -> Result<(), ServiceError> {
        let body = serde_json::to_string(&notification)
            .map_err(|e| ServiceError::SerializationError(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .body(body.clone());
        if let Some(signature) = self.sign(&body) {
            request = request.header("x-storefront-signature", signature);
        }

        let response = request.send().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("notification dispatch failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "notification service returned {}",
                response.status()
            )));
        }

        info!("Notification dispatched");
        Ok(())
    }
}

/// No-op notifier used when no notification endpoint is configured.
#[derive(Clone, Default)]
pub struct NullNotifier;

#[async_trait]
impl NotificationGateway for NullNotifier {
    async fn deliver(&self, notification: StorefrontNotification) -> Result<(), ServiceError> {
        debug!(notification = ?notification, "Notification delivery disabled; dropping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_with_type_tag() {
        let note = StorefrontNotification::OrderConfirmation {
            order_id: Uuid::nil(),
            order_number: "ORD-ABCD1234".into(),
            user_id: Uuid::nil(),
            total: "900".into(),
        };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["type"], "order_confirmation");
        assert_eq!(json["order_number"], "ORD-ABCD1234");
    }

    #[tokio::test]
    async fn null_notifier_always_succeeds() {
        let notifier = NullNotifier;
        let outcome = notifier
            .deliver(StorefrontNotification::PaymentConfirmation {
                order_id: Uuid::nil(),
                order_number: "ORD-TEST".into(),
                user_id: Uuid::nil(),
                payment_id: "pay_1".into(),
            })
            .await;
        assert!(outcome.is_ok());
    }
}

use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{GatewayPayment, PaymentGateway},
    services::{
        inventory::InventoryService,
        notifications::{NotificationGateway, StorefrontNotification},
        orders::{CreateOrderRequest, OrderService},
    },
};

type HmacSha256 = Hmac<Sha256>;

/// HMAC over `"{gateway_order_id}|{gateway_payment_id}"` with the API key
/// secret, hex-encoded; what the gateway hands the client on return.
pub fn verification_signature(secret: &str, order_id: &str, payment_id: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// HMAC over the exact raw webhook body with the separate webhook secret.
pub fn webhook_signature(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Webhook event types this reconciler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
pub enum WebhookEventKind {
    #[strum(serialize = "payment.captured")]
    PaymentCaptured,
    #[strum(serialize = "payment.failed")]
    PaymentFailed,
    #[strum(serialize = "refund.processed")]
    RefundProcessed,
}

/// Refund entity carried in `refund.processed` payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundEntity {
    pub id: String,
    pub payment_id: String,
    pub amount: i64,
    #[serde(default)]
    pub notes: serde_json::Value,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct VerifyPaymentRequest {
    #[validate(length(min = 1))]
    pub razorpay_order_id: String,
    #[validate(length(min = 1))]
    pub razorpay_payment_id: String,
    #[validate(length(min = 1))]
    pub razorpay_signature: String,
    /// Cart snapshot for the post-verification creation path: used only when
    /// no order exists yet for the gateway order id.
    pub order_data: Option<CreateOrderRequest>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyPaymentOutcome {
    pub order_id: Uuid,
    pub order_number: String,
    /// False when this call was a duplicate of an already-applied capture.
    pub newly_paid: bool,
}

#[derive(Clone)]
pub struct PaymentCredentials {
    /// API key secret; signs the synchronous verification payload.
    pub key_secret: String,
    /// Separate secret for webhook body signatures.
    pub webhook_secret: String,
}

/// The payment reconciler: two independent, unordered, possibly-duplicated
/// delivery paths (client-return verification and gateway webhook) converge
/// through one idempotent `mark_paid` keyed by gateway payment id.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    orders: Arc<OrderService>,
    inventory: Arc<InventoryService>,
    notifier: Arc<dyn NotificationGateway>,
    gateway: Arc<dyn PaymentGateway>,
    credentials: PaymentCredentials,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        orders: Arc<OrderService>,
        inventory: Arc<InventoryService>,
        notifier: Arc<dyn NotificationGateway>,
        gateway: Arc<dyn PaymentGateway>,
        credentials: PaymentCredentials,
    ) -> Self {
        Self {
            db,
            event_sender,
            orders,
            inventory,
            notifier,
            gateway,
            credentials,
        }
    }

    /// Path A: synchronous verification invoked by the client on return from
    /// the gateway. Signature first, then the authoritative payment object;
    /// nothing client-supplied is trusted beyond the correlation ids.
    #[instrument(skip(self, request), fields(gateway_order_id = %request.razorpay_order_id))]
    pub async fn verify_payment(
        &self,
        request: VerifyPaymentRequest,
    ) -> Result<VerifyPaymentOutcome, ServiceError> {
        request.validate()?;

        let expected = verification_signature(
            &self.credentials.key_secret,
            &request.razorpay_order_id,
            &request.razorpay_payment_id,
        );
        if !constant_time_eq(&expected, &request.razorpay_signature) {
            counter!("storefront_payment_signature_failures_total", 1);
            warn!(
                gateway_order_id = %request.razorpay_order_id,
                "Payment verification signature mismatch"
            );
            return Err(ServiceError::Unauthorized(
                "invalid payment signature".to_string(),
            ));
        }

        let payment = self
            .gateway
            .fetch_payment(&request.razorpay_payment_id)
            .await?;
        if !payment.is_captured() {
            return Err(ServiceError::PaymentFailed(format!(
                "payment {} is not captured (status: {})",
                payment.id, payment.status
            )));
        }

        let order = match self
            .find_order_for_payment(Some(&request.razorpay_order_id), &payment)
            .await?
        {
            Some(order) => order,
            None => {
                let Some(mut order_data) = request.order_data else {
                    return Err(ServiceError::NotFound(format!(
                        "No order found for gateway order {}",
                        request.razorpay_order_id
                    )));
                };
                // Post-verification creation path: the assembler persists the
                // snapshot now, correlated to the verified gateway order.
                order_data.razorpay_order_id = Some(request.razorpay_order_id.clone());
                let created = self.orders.create_order(order_data).await?;
                OrderEntity::find_by_id(created.id)
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "order {} vanished after creation",
                            created.id
                        ))
                    })?
            }
        };

        let newly_paid = self.mark_paid(&order, &payment).await?;
        Ok(VerifyPaymentOutcome {
            order_id: order.id,
            order_number: order.order_number,
            newly_paid,
        })
    }

    /// Path B: webhook dispatch. The handler has already verified the body
    /// signature; unresolved correlation is logged and acknowledged so the
    /// gateway's redelivery does not retry forever against a dead letter.
    #[instrument(skip(self, payload))]
    pub async fn handle_webhook_event(
        &self,
        payload: serde_json::Value,
    ) -> Result<(), ServiceError> {
        let event = payload
            .get("event")
            .and_then(|value| value.as_str())
            .unwrap_or_default();

        match WebhookEventKind::from_str(event) {
            Ok(WebhookEventKind::PaymentCaptured) => {
                let payment = Self::payment_entity(&payload)?;
                if !payment.is_captured() {
                    warn!(
                        payment_id = %payment.id,
                        status = %payment.status,
                        "payment.captured event carried a non-captured payment; ignoring"
                    );
                    return Ok(());
                }
                let Some(order) = self.find_order_for_payment(None, &payment).await? else {
                    warn!(
                        payment_id = %payment.id,
                        gateway_order_id = ?payment.order_id,
                        "No order found for captured payment; acknowledging for redelivery"
                    );
                    return Ok(());
                };
                match self.mark_paid(&order, &payment).await {
                    Ok(_) => Ok(()),
                    // A different payment already owns this order; surfaced at
                    // warn inside mark_paid, acknowledged here.
                    Err(ServiceError::Conflict(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Ok(WebhookEventKind::PaymentFailed) => {
                let payment = Self::payment_entity(&payload)?;
                self.record_payment_failure(&payment).await
            }
            Ok(WebhookEventKind::RefundProcessed) => {
                let refund = Self::refund_entity(&payload)?;
                self.record_refund(&refund).await
            }
            Err(_) => {
                info!(event = %event, "Unhandled payment webhook event type");
                Ok(())
            }
        }
    }

    /// The single idempotent capture write both paths converge on.
    ///
    /// Returns true when this call transitioned the order to paid; false for
    /// a duplicate delivery of the same payment id. A different payment id
    /// against an already-paid order is a conflict.
    pub async fn mark_paid(
        &self,
        order: &OrderModel,
        payment: &GatewayPayment,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let payment_result = json!({
            "id": payment.id,
            "status": "completed",
            "email": payment.email,
            "payer": payment.contact,
        });
        let payment_details = json!({
            "method": payment.method,
            "bank": payment.bank,
            "wallet": payment.wallet,
            "vpa": payment.vpa,
        });

        let updated = OrderEntity::update_many()
            .col_expr(order::Column::IsPaid, Expr::value(true))
            .col_expr(order::Column::PaidAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::RazorpayPaymentId,
                Expr::value(Some(payment.id.clone())),
            )
            .col_expr(
                order::Column::RazorpayOrderId,
                Expr::value(
                    payment
                        .order_id
                        .clone()
                        .or_else(|| order.razorpay_order_id.clone()),
                ),
            )
            .col_expr(
                order::Column::PaymentResult,
                Expr::value(Some(payment_result)),
            )
            .col_expr(
                order::Column::PaymentDetails,
                Expr::value(Some(payment_details)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::IsPaid.eq(false))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            let current = OrderEntity::find_by_id(order.id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Order {} not found", order.id))
                })?;
            if current.razorpay_payment_id.as_deref() == Some(payment.id.as_str()) {
                info!(
                    order_id = %order.id,
                    payment_id = %payment.id,
                    "Duplicate capture delivery; order already paid by this payment"
                );
                return Ok(false);
            }
            warn!(
                order_id = %order.id,
                existing_payment = ?current.razorpay_payment_id,
                incoming_payment = %payment.id,
                "Order already paid through a different payment"
            );
            return Err(ServiceError::Conflict(format!(
                "order {} is already paid through a different payment",
                order.order_number
            )));
        }

        if let Some(expected_minor) = (order.total * Decimal::from(100)).round().to_i64() {
            if expected_minor != payment.amount {
                warn!(
                    order_id = %order.id,
                    order_total_minor = expected_minor,
                    captured_minor = payment.amount,
                    "Captured amount differs from order snapshot"
                );
            }
        }

        counter!("storefront_payments_captured_total", 1);
        info!(order_id = %order.id, payment_id = %payment.id, "Order marked paid");
        let _ = self
            .event_sender
            .send(Event::OrderPaid {
                order_id: order.id,
                payment_id: payment.id.clone(),
            })
            .await;

        self.start_fulfillment(order.id).await;

        // Best-effort; the payment record is already durable.
        if let Err(err) = self
            .notifier
            .deliver(StorefrontNotification::PaymentConfirmation {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id: order.user_id,
                payment_id: payment.id.clone(),
            })
            .await
        {
            warn!(order_id = %order.id, error = %err, "Payment confirmation dispatch failed");
        }

        Ok(true)
    }

    /// Moves a freshly paid order into fulfillment and commits inventory in
    /// one transaction. Failure leaves the order paid but still pending; the
    /// oversell is reported, never silently absorbed, and an admin retry of
    /// the status transition remains possible.
    async fn start_fulfillment(&self, order_id: Uuid) {
        if let Err(err) = self.try_start_fulfillment(order_id).await {
            match err {
                ServiceError::InsufficientStock(ref msg) => {
                    error!(
                        order_id = %order_id,
                        reason = %msg,
                        "Paid order could not enter fulfillment: insufficient stock"
                    );
                }
                other => {
                    error!(
                        order_id = %order_id,
                        error = %other,
                        "Failed to start fulfillment for paid order"
                    );
                }
            }
        }
    }

    async fn try_start_fulfillment(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let moved = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Processing))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
            .exec(&txn)
            .await?;

        if moved.rows_affected == 0 {
            // Another writer (an admin, or the racing delivery path) already
            // moved the order on; the inventory gate has it covered.
            txn.commit().await?;
            return Ok(());
        }

        if let Err(err) = self.inventory.commit_in(&txn, order_id).await {
            txn.rollback().await.ok();
            return Err(err);
        }

        txn.commit().await?;

        let _ = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                old_status: OrderStatus::PendingPayment.to_string(),
                new_status: OrderStatus::Processing.to_string(),
            })
            .await;
        Ok(())
    }

    /// `payment.failed`: recorded only while the order is unpaid; a failure
    /// event can never downgrade a captured payment.
    async fn record_payment_failure(&self, payment: &GatewayPayment) -> Result<(), ServiceError> {
        let Some(order) = self.find_order_for_payment(None, payment).await? else {
            warn!(
                payment_id = %payment.id,
                "No order found for failed payment; acknowledging"
            );
            return Ok(());
        };

        let now = Utc::now();
        let payment_result = json!({
            "id": payment.id,
            "status": "failed",
            "reason": payment.error_description,
        });

        let updated = OrderEntity::update_many()
            .col_expr(
                order::Column::PaymentResult,
                Expr::value(Some(payment_result)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::IsPaid.eq(false))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            info!(
                order_id = %order.id,
                payment_id = %payment.id,
                "Ignoring failure event for an order that is already paid"
            );
            return Ok(());
        }

        info!(order_id = %order.id, payment_id = %payment.id, "Payment failure recorded");
        let _ = self
            .event_sender
            .send(Event::OrderPaymentFailed {
                order_id: order.id,
                payment_id: payment.id.clone(),
                reason: payment.error_description.clone(),
            })
            .await;
        Ok(())
    }

    /// `refund.processed`: only a paid order in a refundable state moves to
    /// `Refunded`.
    async fn record_refund(&self, refund: &RefundEntity) -> Result<(), ServiceError> {
        let Some(order) = OrderEntity::find()
            .filter(order::Column::RazorpayPaymentId.eq(refund.payment_id.clone()))
            .one(&*self.db)
            .await?
        else {
            warn!(
                refund_id = %refund.id,
                payment_id = %refund.payment_id,
                "No order found for processed refund; acknowledging"
            );
            return Ok(());
        };

        let now = Utc::now();
        let refund_details = json!({
            "refund_id": refund.id,
            "payment_id": refund.payment_id,
            "amount": refund.amount,
            "processed_at": now.to_rfc3339(),
        });

        let updated = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Refunded))
            .col_expr(
                order::Column::RefundDetails,
                Expr::value(Some(refund_details)),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::IsPaid.eq(true))
            .filter(
                order::Column::Status
                    .is_in([OrderStatus::Processing, OrderStatus::Delivered]),
            )
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            warn!(
                order_id = %order.id,
                refund_id = %refund.id,
                status = %order.status,
                "Refund event for an order not in a refundable state; acknowledging"
            );
            return Ok(());
        }

        info!(order_id = %order.id, refund_id = %refund.id, "Order refunded");
        let _ = self
            .event_sender
            .send(Event::OrderRefunded {
                order_id: order.id,
                refund_id: refund.id.clone(),
            })
            .await;
        Ok(())
    }

    /// Locates the order a gateway payment belongs to: first by the gateway
    /// order correlation id, then by the storefront order id carried in the
    /// payment's notes.
    async fn find_order_for_payment(
        &self,
        gateway_order_id: Option<&str>,
        payment: &GatewayPayment,
    ) -> Result<Option<OrderModel>, ServiceError> {
        let correlation = gateway_order_id
            .map(str::to_string)
            .or_else(|| payment.order_id.clone());

        if let Some(gateway_order_id) = correlation {
            let found = OrderEntity::find()
                .filter(order::Column::RazorpayOrderId.eq(gateway_order_id))
                .one(&*self.db)
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(raw) = payment.note("order_id") {
            if let Ok(order_id) = Uuid::parse_str(raw) {
                return Ok(OrderEntity::find_by_id(order_id).one(&*self.db).await?);
            }
        }

        Ok(None)
    }

    fn payment_entity(payload: &serde_json::Value) -> Result<GatewayPayment, ServiceError> {
        let entity = payload
            .pointer("/payload/payment/entity")
            .cloned()
            .ok_or_else(|| {
                ServiceError::BadRequest("webhook payload is missing payment entity".to_string())
            })?;
        serde_json::from_value(entity)
            .map_err(|e| ServiceError::BadRequest(format!("malformed payment entity: {}", e)))
    }

    fn refund_entity(payload: &serde_json::Value) -> Result<RefundEntity, ServiceError> {
        let entity = payload
            .pointer("/payload/refund/entity")
            .cloned()
            .ok_or_else(|| {
                ServiceError::BadRequest("webhook payload is missing refund entity".to_string())
            })?;
        serde_json::from_value(entity)
            .map_err(|e| ServiceError::BadRequest(format!("malformed refund entity: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{coupons::CouponService, notifications::NullNotifier};
    use async_trait::async_trait;
    use assert_matches::assert_matches;
    use mockall::mock;
    use sea_orm::DatabaseConnection;
    use tokio::sync::mpsc;

    mock! {
        pub Gateway {}

        #[async_trait]
        impl PaymentGateway for Gateway {
            async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError>;
        }
    }

    fn service_with_gateway(gateway: MockGateway) -> PaymentService {
        let db = Arc::new(DatabaseConnection::Disconnected);
        let (tx, _rx) = mpsc::channel(16);
        let sender = EventSender::new(tx);
        let coupons = Arc::new(CouponService::new(db.clone(), sender.clone()));
        let inventory = Arc::new(InventoryService::new(db.clone(), sender.clone()));
        let notifier: Arc<dyn NotificationGateway> = Arc::new(NullNotifier);
        let orders = Arc::new(OrderService::new(
            db.clone(),
            sender.clone(),
            coupons,
            inventory.clone(),
            notifier.clone(),
        ));
        PaymentService::new(
            db,
            sender,
            orders,
            inventory,
            notifier,
            Arc::new(gateway),
            PaymentCredentials {
                key_secret: "key_secret".to_string(),
                webhook_secret: "webhook_secret".to_string(),
            },
        )
    }

    #[test]
    fn verification_signature_matches_known_vector() {
        // HMAC-SHA256("secret", "order_1|pay_1"), independently computed.
        let sig = verification_signature("secret", "order_1", "pay_1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, verification_signature("secret", "order_1", "pay_1"));
        assert_ne!(sig, verification_signature("secret", "order_1", "pay_2"));
        assert_ne!(sig, verification_signature("other", "order_1", "pay_1"));
    }

    #[test]
    fn constant_time_eq_rejects_any_difference() {
        assert!(constant_time_eq("abcdef", "abcdef"));
        assert!(!constant_time_eq("abcdef", "abcdee"));
        assert!(!constant_time_eq("abcdef", "abcde"));
        assert!(!constant_time_eq("", "a"));
    }

    #[test]
    fn webhook_event_kinds_parse_from_gateway_strings() {
        assert_eq!(
            WebhookEventKind::from_str("payment.captured").unwrap(),
            WebhookEventKind::PaymentCaptured
        );
        assert_eq!(
            WebhookEventKind::from_str("payment.failed").unwrap(),
            WebhookEventKind::PaymentFailed
        );
        assert_eq!(
            WebhookEventKind::from_str("refund.processed").unwrap(),
            WebhookEventKind::RefundProcessed
        );
        assert!(WebhookEventKind::from_str("order.paid").is_err());
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_before_any_gateway_call() {
        let mut gateway = MockGateway::new();
        gateway.expect_fetch_payment().times(0);
        let service = service_with_gateway(gateway);

        let outcome = service
            .verify_payment(VerifyPaymentRequest {
                razorpay_order_id: "order_1".to_string(),
                razorpay_payment_id: "pay_1".to_string(),
                razorpay_signature: "deadbeef".to_string(),
                order_data: None,
            })
            .await;

        assert_matches!(outcome, Err(ServiceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn non_captured_payment_is_rejected() {
        let mut gateway = MockGateway::new();
        gateway.expect_fetch_payment().returning(|payment_id| {
            Ok(GatewayPayment {
                id: payment_id.to_string(),
                order_id: Some("order_1".to_string()),
                status: "authorized".to_string(),
                method: None,
                amount: 90000,
                currency: None,
                email: None,
                contact: None,
                bank: None,
                wallet: None,
                vpa: None,
                notes: serde_json::Value::Null,
                error_description: None,
            })
        });
        let service = service_with_gateway(gateway);

        let signature = verification_signature("key_secret", "order_1", "pay_1");
        let outcome = service
            .verify_payment(VerifyPaymentRequest {
                razorpay_order_id: "order_1".to_string(),
                razorpay_payment_id: "pay_1".to_string(),
                razorpay_signature: signature,
                order_data: None,
            })
            .await;

        assert_matches!(outcome, Err(ServiceError::PaymentFailed(_)));
    }

    #[test]
    fn payment_entity_extraction_requires_the_nested_shape() {
        let good = serde_json::json!({
            "event": "payment.captured",
            "payload": { "payment": { "entity": {
                "id": "pay_1", "status": "captured", "amount": 1000
            }}}
        });
        assert!(PaymentService::payment_entity(&good).is_ok());

        let bad = serde_json::json!({"event": "payment.captured", "payload": {}});
        assert_matches!(
            PaymentService::payment_entity(&bad),
            Err(ServiceError::BadRequest(_))
        );
    }
}

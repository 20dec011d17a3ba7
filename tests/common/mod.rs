#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use storefront_api::{
    db,
    errors::ServiceError,
    events::{process_events, EventSender},
    gateway::{GatewayPayment, PaymentGateway},
    handlers::AppServices,
    services::catalog::{CreateProductRequest, ProductResponse, SizeInput},
    services::coupons::CreateCouponRequest,
    services::notifications::{NotificationGateway, StorefrontNotification},
    services::orders::{CreateOrderRequest, OrderLineInput, ShippingAddress},
    services::payments::PaymentCredentials,
};

pub const KEY_SECRET: &str = "test_key_secret";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret";

/// Records every delivered notification so tests can assert exactly-once
/// side effects.
#[derive(Default)]
pub struct CountingNotifier {
    delivered: Mutex<Vec<StorefrontNotification>>,
}

impl CountingNotifier {
    pub fn delivered(&self) -> Vec<StorefrontNotification> {
        self.delivered.lock().expect("notifier lock").clone()
    }

    pub fn payment_confirmations(&self) -> usize {
        self.delivered()
            .iter()
            .filter(|n| matches!(n, StorefrontNotification::PaymentConfirmation { .. }))
            .count()
    }

    pub fn order_confirmations(&self) -> usize {
        self.delivered()
            .iter()
            .filter(|n| matches!(n, StorefrontNotification::OrderConfirmation { .. }))
            .count()
    }
}

#[async_trait]
impl NotificationGateway for CountingNotifier {
    async fn deliver(&self, notification: StorefrontNotification) -> Result<(), ServiceError> {
        self.delivered
            .lock()
            .expect("notifier lock")
            .push(notification);
        Ok(())
    }
}

/// In-memory stand-in for the gateway's payment-fetch API.
#[derive(Default)]
pub struct StubGateway {
    payments: Mutex<HashMap<String, GatewayPayment>>,
}

impl StubGateway {
    pub fn put(&self, payment: GatewayPayment) {
        self.payments
            .lock()
            .expect("gateway lock")
            .insert(payment.id.clone(), payment);
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
        self.payments
            .lock()
            .expect("gateway lock")
            .get(payment_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::ExternalServiceError(format!(
                    "gateway has no payment {}",
                    payment_id
                ))
            })
    }
}

pub struct TestApp {
    pub db: Arc<sea_orm::DatabaseConnection>,
    pub services: AppServices,
    pub notifier: Arc<CountingNotifier>,
    pub gateway: Arc<StubGateway>,
    pub sender: EventSender,
}

impl TestApp {
    /// Full HTTP-layer state for router-level tests. The Redis client is
    /// constructed lazily and never connected unless a webhook carries an
    /// event id.
    pub fn app_state(&self) -> storefront_api::AppState {
        let config = storefront_api::config::AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "127.0.0.1".to_string(),
            18080,
            "test".to_string(),
            "rzp_test_key".to_string(),
            KEY_SECRET.to_string(),
            WEBHOOK_SECRET.to_string(),
        );
        let redis =
            Arc::new(redis::Client::open(config.redis_url.clone()).expect("redis client"));
        storefront_api::AppState {
            db: self.db.clone(),
            config,
            event_sender: self.sender.clone(),
            services: self.services.clone(),
            redis,
        }
    }
}

/// Fresh in-memory database with migrations applied and the full service
/// graph wired against the stub gateway and counting notifier.
///
/// A single pooled connection keeps every statement on one SQLite memory
/// database.
pub async fn setup() -> TestApp {
    let cfg = db::DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        min_connections: 1,
        ..Default::default()
    };
    let pool = db::establish_connection_with_config(&cfg)
        .await
        .expect("db connect");
    db::run_migrations(&pool).await.expect("migrations");

    let db_arc = Arc::new(pool);
    let (tx, rx) = mpsc::channel(256);
    let sender = EventSender::new(tx);
    tokio::spawn(process_events(rx));

    let notifier = Arc::new(CountingNotifier::default());
    let gateway = Arc::new(StubGateway::default());
    let services = AppServices::new(
        db_arc.clone(),
        sender.clone(),
        gateway.clone(),
        notifier.clone(),
        PaymentCredentials {
            key_secret: KEY_SECRET.to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
        },
    );

    TestApp {
        db: db_arc,
        services,
        notifier,
        gateway,
        sender,
    }
}

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        first_name: "Asha".into(),
        last_name: "Rao".into(),
        phone_number: "+919999999999".into(),
        address1: "12 MG Road".into(),
        address2: None,
        city: "Bengaluru".into(),
        state: "KA".into(),
        zip_code: "560001".into(),
        country: "IN".into(),
    }
}

pub async fn seed_product(app: &TestApp, label: &str, qty: i32, price: Decimal) -> ProductResponse {
    app.services
        .catalog
        .create_product(CreateProductRequest {
            title: "Vetiver Attar".into(),
            description: None,
            image: None,
            discount_percent: Decimal::ZERO,
            is_best_seller: false,
            is_featured: false,
            sizes: vec![SizeInput {
                label: label.into(),
                qty,
                price,
            }],
        })
        .await
        .expect("seed product")
}

pub fn order_request(
    user_id: Uuid,
    product_id: Uuid,
    size: &str,
    quantity: i32,
    unit_price: Decimal,
) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        items: vec![OrderLineInput {
            product_id: product_id.to_string(),
            size: Some(size.to_string()),
            name: "Vetiver Attar".into(),
            image: None,
            quantity,
            unit_price,
        }],
        shipping_address: shipping_address(),
        payment_method: "razorpay".into(),
        coupon_code: None,
        razorpay_order_id: None,
    }
}

pub fn coupon_request(code: &str, percent: Decimal) -> CreateCouponRequest {
    CreateCouponRequest {
        code: code.to_string(),
        discount_percent: percent,
        start_date: Utc::now() - Duration::days(1),
        end_date: Utc::now() + Duration::days(30),
        minimum_order_value: None,
        max_users: None,
        per_user_limit: false,
    }
}

/// A captured gateway payment correlated to an order via the gateway order
/// id; `amount` is in minor units.
pub fn captured_payment(payment_id: &str, gateway_order_id: &str, amount: i64) -> GatewayPayment {
    GatewayPayment {
        id: payment_id.to_string(),
        order_id: Some(gateway_order_id.to_string()),
        status: "captured".to_string(),
        method: Some("upi".to_string()),
        amount,
        currency: Some("INR".to_string()),
        email: Some("shopper@example.com".to_string()),
        contact: Some("+919999999999".to_string()),
        bank: None,
        wallet: None,
        vpa: Some("shopper@upi".to_string()),
        notes: serde_json::Value::Null,
        error_description: None,
    }
}

/// Webhook envelope the gateway would post for a payment event.
pub fn payment_webhook_body(event: &str, payment: &GatewayPayment) -> serde_json::Value {
    serde_json::json!({
        "event": event,
        "payload": { "payment": { "entity": payment } }
    })
}

pub fn refund_webhook_body(refund_id: &str, payment_id: &str, amount: i64) -> serde_json::Value {
    serde_json::json!({
        "event": "refund.processed",
        "payload": { "refund": { "entity": {
            "id": refund_id,
            "payment_id": payment_id,
            "amount": amount,
        }}}
    })
}

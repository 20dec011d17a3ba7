mod common;

use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use common::{
    captured_payment, order_request, payment_webhook_body, refund_webhook_body, seed_product,
    setup, shipping_address, TestApp, KEY_SECRET,
};
use storefront_api::entities::order::{self, OrderStatus};
use storefront_api::entities::product_size;
use storefront_api::errors::ServiceError;
use storefront_api::services::orders::{CreateOrderRequest, OrderLineInput, OrderResponse};
use storefront_api::services::payments::{verification_signature, VerifyPaymentRequest};

async fn paid_fixture(app: &TestApp, gateway_order_id: &str) -> (Uuid, OrderResponse) {
    let product = seed_product(app, "100ml", 10, dec!(500)).await;
    let mut request = order_request(Uuid::new_v4(), product.id, "100ml", 2, dec!(500));
    request.razorpay_order_id = Some(gateway_order_id.to_string());
    let created = app.services.orders.create_order(request).await.unwrap();
    (product.id, created)
}

async fn order_state(app: &TestApp, order_id: Uuid) -> order::Model {
    order::Entity::find_by_id(order_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
}

async fn size_state(app: &TestApp, product_id: Uuid, label: &str) -> (i32, i32) {
    let size = product_size::Entity::find()
        .filter(product_size::Column::ProductId.eq(product_id))
        .filter(product_size::Column::Label.eq(label))
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    (size.qty, size.sold)
}

fn verify_request(gateway_order_id: &str, payment_id: &str) -> VerifyPaymentRequest {
    VerifyPaymentRequest {
        razorpay_order_id: gateway_order_id.to_string(),
        razorpay_payment_id: payment_id.to_string(),
        razorpay_signature: verification_signature(KEY_SECRET, gateway_order_id, payment_id),
        order_data: None,
    }
}

#[tokio::test]
async fn verification_marks_the_order_paid_and_starts_fulfillment() {
    let app = setup().await;
    let (product_id, created) = paid_fixture(&app, "order_A").await;
    app.gateway.put(captured_payment("pay_A", "order_A", 100_000));

    let outcome = app
        .services
        .payments
        .verify_payment(verify_request("order_A", "pay_A"))
        .await
        .unwrap();
    assert_eq!(outcome.order_id, created.id);
    assert!(outcome.newly_paid);

    let stored = order_state(&app, created.id).await;
    assert!(stored.is_paid);
    assert!(stored.paid_at.is_some());
    assert_eq!(stored.status, OrderStatus::Processing);
    assert!(stored.inventory_committed);
    assert_eq!(stored.razorpay_payment_id.as_deref(), Some("pay_A"));
    let result = stored.payment_result.unwrap();
    assert_eq!(result["id"], "pay_A");
    assert_eq!(result["status"], "completed");

    assert_eq!(size_state(&app, product_id, "100ml").await, (8, 2));
    assert_eq!(app.notifier.payment_confirmations(), 1);
}

#[tokio::test]
async fn repeated_verification_is_idempotent() {
    let app = setup().await;
    let (product_id, created) = paid_fixture(&app, "order_B").await;
    app.gateway.put(captured_payment("pay_B", "order_B", 100_000));

    let first = app
        .services
        .payments
        .verify_payment(verify_request("order_B", "pay_B"))
        .await
        .unwrap();
    assert!(first.newly_paid);

    let second = app
        .services
        .payments
        .verify_payment(verify_request("order_B", "pay_B"))
        .await
        .unwrap();
    assert_eq!(second.order_id, created.id);
    assert!(!second.newly_paid);

    // No duplicated side effects: one decrement, one confirmation.
    assert_eq!(size_state(&app, product_id, "100ml").await, (8, 2));
    assert_eq!(app.notifier.payment_confirmations(), 1);
}

#[tokio::test]
async fn tampered_signature_mutates_nothing() {
    let app = setup().await;
    let (product_id, created) = paid_fixture(&app, "order_C").await;
    app.gateway.put(captured_payment("pay_C", "order_C", 100_000));

    let mut request = verify_request("order_C", "pay_C");
    // Flip one byte of the valid signature.
    let mut bytes = request.razorpay_signature.into_bytes();
    bytes[0] = if bytes[0] == b'a' { b'b' } else { b'a' };
    request.razorpay_signature = String::from_utf8(bytes).unwrap();

    let err = app.services.payments.verify_payment(request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized(_)));

    let stored = order_state(&app, created.id).await;
    assert!(!stored.is_paid);
    assert_eq!(stored.status, OrderStatus::PendingPayment);
    assert_eq!(size_state(&app, product_id, "100ml").await, (10, 0));
    assert_eq!(app.notifier.payment_confirmations(), 0);
}

#[tokio::test]
async fn verification_can_assemble_the_order_after_capture() {
    // Post-verification creation path: no order exists yet for the gateway
    // order; the verified call carries the cart snapshot.
    let app = setup().await;
    let product = seed_product(&app, "100ml", 10, dec!(500)).await;
    app.gateway.put(captured_payment("pay_D", "order_D", 50_000));

    let mut request = verify_request("order_D", "pay_D");
    request.order_data = Some(CreateOrderRequest {
        user_id: Uuid::new_v4(),
        items: vec![OrderLineInput {
            product_id: product.id.to_string(),
            size: Some("100ml".into()),
            name: "Vetiver Attar".into(),
            image: None,
            quantity: 1,
            unit_price: dec!(500),
        }],
        shipping_address: shipping_address(),
        payment_method: "razorpay".into(),
        coupon_code: None,
        razorpay_order_id: None,
    });

    let outcome = app.services.payments.verify_payment(request).await.unwrap();
    assert!(outcome.newly_paid);

    let stored = order_state(&app, outcome.order_id).await;
    assert!(stored.is_paid);
    assert_eq!(stored.razorpay_order_id.as_deref(), Some("order_D"));
    assert_eq!(stored.status, OrderStatus::Processing);
    assert_eq!(size_state(&app, product.id, "100ml").await, (9, 1));
}

#[tokio::test]
async fn webhook_delivery_before_verification_converges() {
    let app = setup().await;
    let (product_id, created) = paid_fixture(&app, "order_E").await;
    let payment = captured_payment("pay_E", "order_E", 100_000);
    app.gateway.put(payment.clone());

    // Webhook lands first.
    app.services
        .payments
        .handle_webhook_event(payment_webhook_body("payment.captured", &payment))
        .await
        .unwrap();

    let stored = order_state(&app, created.id).await;
    assert!(stored.is_paid);
    assert_eq!(stored.status, OrderStatus::Processing);

    // The client's verification call arrives late and is a clean duplicate.
    let outcome = app
        .services
        .payments
        .verify_payment(verify_request("order_E", "pay_E"))
        .await
        .unwrap();
    assert!(!outcome.newly_paid);

    assert_eq!(size_state(&app, product_id, "100ml").await, (8, 2));
    assert_eq!(app.notifier.payment_confirmations(), 1);
}

#[tokio::test]
async fn duplicate_webhook_deliveries_converge() {
    let app = setup().await;
    let (product_id, created) = paid_fixture(&app, "order_F").await;
    let payment = captured_payment("pay_F", "order_F", 100_000);
    let body = payment_webhook_body("payment.captured", &payment);

    app.services
        .payments
        .handle_webhook_event(body.clone())
        .await
        .unwrap();
    app.services
        .payments
        .handle_webhook_event(body)
        .await
        .unwrap();

    let stored = order_state(&app, created.id).await;
    assert!(stored.is_paid);
    assert_eq!(size_state(&app, product_id, "100ml").await, (8, 2));
    assert_eq!(app.notifier.payment_confirmations(), 1);
}

#[tokio::test]
async fn failure_events_never_downgrade_a_paid_order() {
    let app = setup().await;
    let (_, created) = paid_fixture(&app, "order_G").await;

    // Failure while unpaid is recorded.
    let mut failed = captured_payment("pay_G1", "order_G", 100_000);
    failed.status = "failed".to_string();
    failed.error_description = Some("card declined".to_string());
    app.services
        .payments
        .handle_webhook_event(payment_webhook_body("payment.failed", &failed))
        .await
        .unwrap();

    let stored = order_state(&app, created.id).await;
    assert!(!stored.is_paid);
    assert_eq!(stored.payment_result.as_ref().unwrap()["status"], "failed");

    // A retried payment captures.
    let captured = captured_payment("pay_G2", "order_G", 100_000);
    app.gateway.put(captured.clone());
    app.services
        .payments
        .handle_webhook_event(payment_webhook_body("payment.captured", &captured))
        .await
        .unwrap();

    // A stale failure event for the old attempt cannot downgrade it.
    app.services
        .payments
        .handle_webhook_event(payment_webhook_body("payment.failed", &failed))
        .await
        .unwrap();

    let stored = order_state(&app, created.id).await;
    assert!(stored.is_paid);
    assert_eq!(stored.payment_result.as_ref().unwrap()["status"], "completed");
    assert_eq!(stored.razorpay_payment_id.as_deref(), Some("pay_G2"));
}

#[tokio::test]
async fn refund_moves_a_paid_order_to_refunded() {
    let app = setup().await;
    let (_, created) = paid_fixture(&app, "order_H").await;
    let payment = captured_payment("pay_H", "order_H", 100_000);
    app.services
        .payments
        .handle_webhook_event(payment_webhook_body("payment.captured", &payment))
        .await
        .unwrap();

    app.services
        .payments
        .handle_webhook_event(refund_webhook_body("rfnd_H", "pay_H", 100_000))
        .await
        .unwrap();

    let stored = order_state(&app, created.id).await;
    assert_eq!(stored.status, OrderStatus::Refunded);
    let details = stored.refund_details.unwrap();
    assert_eq!(details["refund_id"], "rfnd_H");
    assert_eq!(details["amount"], 100_000);
}

#[tokio::test]
async fn refund_for_an_unpaid_order_is_acknowledged_without_state_change() {
    let app = setup().await;
    let (_, created) = paid_fixture(&app, "order_I").await;

    // No payment ever captured; a refund event cannot apply.
    app.services
        .payments
        .handle_webhook_event(refund_webhook_body("rfnd_I", "pay_I", 100_000))
        .await
        .unwrap();

    let stored = order_state(&app, created.id).await;
    assert_eq!(stored.status, OrderStatus::PendingPayment);
    assert!(stored.refund_details.is_none());
}

#[tokio::test]
async fn unknown_webhook_events_are_acknowledged() {
    let app = setup().await;
    let body = serde_json::json!({"event": "invoice.paid", "payload": {}});
    assert!(app.services.payments.handle_webhook_event(body).await.is_ok());
}

#[tokio::test]
async fn webhook_for_an_unknown_order_is_acknowledged_for_redelivery() {
    let app = setup().await;
    let payment = captured_payment("pay_zzz", "order_zzz", 1_000);
    let outcome = app
        .services
        .payments
        .handle_webhook_event(payment_webhook_body("payment.captured", &payment))
        .await;
    assert!(outcome.is_ok());
}

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use tower::ServiceExt;
use uuid::Uuid;

use common::{captured_payment, order_request, payment_webhook_body, seed_product, setup, WEBHOOK_SECRET};
use storefront_api::entities::order;
use storefront_api::services::payments::webhook_signature;

fn webhook_request(body: &[u8], signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/payments/webhook")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", signature)
        .body(Body::from(body.to_vec()))
        .expect("request build")
}

#[tokio::test]
async fn valid_webhook_signature_is_accepted_and_applied() {
    let app = setup().await;
    let product = seed_product(&app, "100ml", 10, dec!(500)).await;
    let mut request = order_request(Uuid::new_v4(), product.id, "100ml", 2, dec!(500));
    request.razorpay_order_id = Some("order_W1".to_string());
    let created = app.services.orders.create_order(request).await.unwrap();

    let payment = captured_payment("pay_W1", "order_W1", 100_000);
    let body = serde_json::to_vec(&payment_webhook_body("payment.captured", &payment)).unwrap();
    let signature = webhook_signature(WEBHOOK_SECRET, &body);

    let router = axum::Router::new()
        .nest("/api/v1", storefront_api::api_v1_routes())
        .with_state(app.app_state());

    let response = router
        .oneshot(webhook_request(&body, &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = order::Entity::find_by_id(created.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_paid);
}

#[tokio::test]
async fn flipping_a_signature_byte_rejects_with_no_state_change() {
    let app = setup().await;
    let product = seed_product(&app, "100ml", 10, dec!(500)).await;
    let mut request = order_request(Uuid::new_v4(), product.id, "100ml", 2, dec!(500));
    request.razorpay_order_id = Some("order_W2".to_string());
    let created = app.services.orders.create_order(request).await.unwrap();

    let payment = captured_payment("pay_W2", "order_W2", 100_000);
    let body = serde_json::to_vec(&payment_webhook_body("payment.captured", &payment)).unwrap();
    let mut signature = webhook_signature(WEBHOOK_SECRET, &body).into_bytes();
    signature[0] = if signature[0] == b'a' { b'b' } else { b'a' };
    let signature = String::from_utf8(signature).unwrap();

    let router = axum::Router::new()
        .nest("/api/v1", storefront_api::api_v1_routes())
        .with_state(app.app_state());

    let response = router
        .oneshot(webhook_request(&body, &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let stored = order::Entity::find_by_id(created.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.is_paid);
}

#[tokio::test]
async fn flipping_a_body_byte_invalidates_the_signature() {
    let app = setup().await;

    let payment = captured_payment("pay_W3", "order_W3", 100_000);
    let mut body = serde_json::to_vec(&payment_webhook_body("payment.captured", &payment)).unwrap();
    let signature = webhook_signature(WEBHOOK_SECRET, &body);
    // Tamper with the body after signing.
    let last = body.len() - 2;
    body[last] = body[last].wrapping_add(1);

    let router = axum::Router::new()
        .nest("/api/v1", storefront_api::api_v1_routes())
        .with_state(app.app_state());

    let response = router
        .oneshot(webhook_request(&body, &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_signature_header_is_rejected() {
    let app = setup().await;
    let router = axum::Router::new()
        .nest("/api/v1", storefront_api::api_v1_routes())
        .with_state(app.app_state());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/payments/webhook")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

use axum::{response::Json, routing::get, Router};
use utoipa::OpenApi;

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = r#"
# Storefront Order & Payment API

The transactional core of the storefront: order lifecycle, coupon redemption,
payment reconciliation against the gateway's dual delivery paths, and
exactly-once inventory adjustment.

## Error Handling

Errors use a consistent envelope with appropriate HTTP status codes:

```json
{
  "error": "Bad Request",
  "message": "Validation failed",
  "request_id": "req-abc123xyz",
  "timestamp": "2025-06-02T10:30:00Z"
}
```

## Pagination

List endpoints accept `page` and `per_page` query parameters.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Products", description = "Catalog products and size variants"),
        (name = "Coupons", description = "Coupon validation and administration"),
        (name = "Orders", description = "Order lifecycle"),
        (name = "Payments", description = "Payment verification and webhooks")
    ),
    paths(
        // Products
        crate::handlers::products::list_products,
        crate::handlers::products::get_product,
        crate::handlers::products::create_product,

        // Coupons
        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::create_coupon,

        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_by_number,
        crate::handlers::orders::get_order_items,
        crate::handlers::orders::create_order,
        crate::handlers::orders::update_order_status,

        // Payments
        crate::handlers::payments::verify_payment,
        crate::handlers::payment_webhooks::payment_webhook,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,

            crate::services::catalog::CreateProductRequest,
            crate::services::catalog::ProductResponse,
            crate::services::catalog::ProductSizeResponse,
            crate::services::catalog::ProductListResponse,
            crate::services::catalog::SizeInput,

            crate::handlers::coupons::ValidateCouponRequest,
            crate::handlers::coupons::ValidateCouponResponse,
            crate::services::coupons::CreateCouponRequest,
            crate::services::coupons::CouponResponse,

            crate::services::orders::CreateOrderRequest,
            crate::services::orders::OrderLineInput,
            crate::services::orders::ShippingAddress,
            crate::services::orders::OrderResponse,
            crate::services::orders::OrderItemResponse,
            crate::services::orders::OrderListResponse,
            crate::services::orders::UpdateOrderStatusRequest,
            crate::entities::order::OrderStatus,

            crate::services::payments::VerifyPaymentRequest,
            crate::services::payments::VerifyPaymentOutcome,

            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

/// Serves the generated OpenAPI document.
pub fn openapi_routes() -> Router<AppState> {
    Router::new().route(
        "/openapi.json",
        get(|| async { Json(ApiDocV1::openapi()) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_generates() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string(&openapi).unwrap();
        assert!(json.contains("Storefront API"));
        assert!(json.contains("/api/v1/orders"));
        assert!(json.contains("/api/v1/payments/webhook"));
    }
}

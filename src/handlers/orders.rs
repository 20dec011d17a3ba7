use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::PaginationParams;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::orders::{
    CreateOrderRequest, OrderItemResponse, OrderListResponse, OrderResponse,
    UpdateOrderStatusRequest,
};
use crate::ApiResponse;

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct OrderFilter {
    /// Scope the listing to one shopper
    pub user_id: Option<Uuid>,
}

/// Create an order from the current cart snapshot (checkout)
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = crate::ApiResponse<OrderResponse>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), ServiceError> {
    let order = state.services.orders.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// List orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(PaginationParams, OrderFilter),
    responses(
        (status = 200, description = "Order list", body = crate::ApiResponse<OrderListResponse>)
    ),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<ApiResponse<OrderListResponse>>, ServiceError> {
    let orders = state
        .services
        .orders
        .list_orders(params.page, params.per_page, filter.user_id)
        .await?;
    Ok(Json(ApiResponse::success(orders)))
}

/// Get an order by ID
#[utoipa::path(
    get,
    path = "/api/v1/orders/:id",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order details", body = crate::ApiResponse<OrderResponse>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
    Ok(Json(ApiResponse::success(order)))
}

/// Get an order by its human-facing order number
#[utoipa::path(
    get,
    path = "/api/v1/orders/by-number/:order_number",
    params(("order_number" = String, Path, description = "Order number")),
    responses(
        (status = 200, description = "Order details", body = crate::ApiResponse<OrderResponse>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order_by_number(&order_number)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))?;
    Ok(Json(ApiResponse::success(order)))
}

/// Get the line-item snapshot of an order
#[utoipa::path(
    get,
    path = "/api/v1/orders/:id/items",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order items", body = crate::ApiResponse<Vec<OrderItemResponse>>)
    ),
    tag = "Orders"
)]
pub async fn get_order_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<OrderItemResponse>>>, ServiceError> {
    let items = state.services.orders.get_order_items(id).await?;
    Ok(Json(ApiResponse::success(items)))
}

/// Update an order's status (admin); entering the fulfillment status commits
/// inventory exactly once
#[utoipa::path(
    put,
    path = "/api/v1/orders/:id/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Order updated", body = crate::ApiResponse<OrderResponse>),
        (status = 400, description = "Illegal transition", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent modification", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .update_order_status(id, request)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order))
        .route("/", get(list_orders))
        .route("/:id", get(get_order))
        .route("/by-number/:order_number", get(get_order_by_number))
        .route("/:id/items", get(get_order_items))
        .route("/:id/status", put(update_order_status))
}

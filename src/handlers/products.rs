use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use super::common::PaginationParams;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::catalog::{CreateProductRequest, ProductListResponse, ProductResponse};
use crate::ApiResponse;

/// Create a catalog product with its size variants
#[utoipa::path(
    post,
    path = "/api/v1/products",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = crate::ApiResponse<ProductResponse>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
pub async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProductResponse>>), ServiceError> {
    let product = state.services.catalog.create_product(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(product))))
}

/// Get a product with its sizes
#[utoipa::path(
    get,
    path = "/api/v1/products/:id",
    params(("id" = Uuid, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product details", body = crate::ApiResponse<ProductResponse>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ProductResponse>>, ServiceError> {
    let product = state.services.catalog.get_product(id).await?;
    Ok(Json(ApiResponse::success(product)))
}

/// List catalog products
#[utoipa::path(
    get,
    path = "/api/v1/products",
    params(PaginationParams),
    responses(
        (status = 200, description = "Product list", body = crate::ApiResponse<ProductListResponse>)
    ),
    tag = "Products"
)]
pub async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<ApiResponse<ProductListResponse>>, ServiceError> {
    let products = state
        .services
        .catalog
        .list_products(params.page, params.per_page)
        .await?;
    Ok(Json(ApiResponse::success(products)))
}

pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_product))
        .route("/", get(list_products))
        .route("/:id", get(get_product))
}

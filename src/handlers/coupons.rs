use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::post,
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::coupons::{CouponDecision, CouponResponse, CreateCouponRequest};
use crate::ApiResponse;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, message = "Coupon code is required"))]
    pub code: String,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub order_value: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ValidateCouponResponse {
    pub discount: Decimal,
}

/// Validate a coupon code for the current cart.
///
/// Rejections come back as `success: false` with the storefront's message
/// strings, never as transport-level errors.
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Validation outcome", body = crate::ApiResponse<ValidateCouponResponse>)
    ),
    tag = "Coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(request): Json<ValidateCouponRequest>,
) -> Result<Json<ApiResponse<ValidateCouponResponse>>, ServiceError> {
    request.validate()?;

    let decision = state
        .services
        .coupons
        .validate_coupon(&request.code, request.user_id, request.order_value)
        .await?;

    let response = match decision {
        CouponDecision::Approved(approved) => ApiResponse::success(ValidateCouponResponse {
            discount: approved.discount_percent,
        }),
        CouponDecision::Rejected(rejection) => {
            ApiResponse::error(rejection.user_message().to_string())
        }
    };
    Ok(Json(response))
}

/// Create a coupon (admin)
#[utoipa::path(
    post,
    path = "/api/v1/coupons",
    request_body = CreateCouponRequest,
    responses(
        (status = 201, description = "Coupon created", body = crate::ApiResponse<CouponResponse>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already exists", body = crate::errors::ErrorResponse)
    ),
    tag = "Coupons"
)]
pub async fn create_coupon(
    State(state): State<AppState>,
    Json(request): Json<CreateCouponRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CouponResponse>>), ServiceError> {
    let coupon = state.services.coupons.create_coupon(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(coupon))))
}

pub fn coupon_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_coupon))
        .route("/validate", post(validate_coupon))
}

use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};

use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{VerifyPaymentOutcome, VerifyPaymentRequest};
use crate::ApiResponse;

/// Synchronous payment verification, invoked by the client after the gateway
/// returns control.
///
/// The signature is recomputed server-side and compared in constant time; the
/// payment object is then fetched from the gateway, so client-supplied amount
/// or status fields are never trusted. Safe to re-invoke: duplicate captures
/// converge on the same order state.
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Payment verified", body = crate::ApiResponse<VerifyPaymentOutcome>),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment not captured", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway unreachable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<Json<ApiResponse<VerifyPaymentOutcome>>, ServiceError> {
    let outcome = state.services.payments.verify_payment(request).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/verify", post(verify_payment))
}

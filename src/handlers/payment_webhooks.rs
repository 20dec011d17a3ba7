use axum::{extract::State, http::HeaderMap, response::IntoResponse};
use bytes::Bytes;
use metrics::counter;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{constant_time_eq, webhook_signature};

// POST /api/v1/payments/webhook
//
// The gateway signs the exact raw body; verification happens before any
// parsing, and a mismatch never mutates state. Processing is synchronous and
// fast so the 2xx goes back before the gateway's retry window.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let secret = &state.config.razorpay_webhook_secret;

    let signature = headers
        .get("x-razorpay-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            warn!("Payment webhook arrived without a signature header");
            ServiceError::Unauthorized("missing webhook signature".to_string())
        })?;

    let expected = webhook_signature(secret, &body);
    if !constant_time_eq(&expected, signature) {
        counter!("storefront_webhook_signature_failures_total", 1);
        warn!("Payment webhook signature verification failed");
        return Err(ServiceError::Unauthorized(
            "invalid webhook signature".to_string(),
        ));
    }

    let json: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    // Best-effort replay dedup by event id; the conditional order updates
    // remain the authoritative guard when Redis is unavailable.
    if let Some(event_id) = headers
        .get("x-razorpay-event-id")
        .and_then(|value| value.to_str().ok())
    {
        let key = format!("wh:{}", event_id);
        if let Ok(mut conn) = state.redis.get_async_connection().await {
            let fresh: Result<bool, _> = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(24 * 3600)
                .query_async(&mut conn)
                .await;
            if let Ok(false) = fresh {
                info!(event_id = %event_id, "Webhook event already processed");
                return Ok((axum::http::StatusCode::OK, "ok"));
            }
        }
    }

    state.services.payments.handle_webhook_event(json).await?;

    Ok((axum::http::StatusCode::OK, "ok"))
}

//! Storefront API Library
//!
//! Transactional core of the storefront: order lifecycle, coupon ledger,
//! payment reconciliation, and inventory control.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::ToSchema;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
    pub redis: Arc<redis::Client>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

// Enhanced API routes function
pub fn api_v1_routes() -> Router<AppState> {
    // Payment webhook (no auth; signature-verified against the raw body)
    let payment_webhook = Router::new().route(
        "/payments/webhook",
        axum::routing::post(handlers::payment_webhooks::payment_webhook),
    );

    Router::new()
        // Status and health endpoints
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        // Catalog API
        .nest("/products", handlers::products::product_routes())
        // Coupon API
        .nest("/coupons", handlers::coupons::coupon_routes())
        // Orders API
        .nest("/orders", handlers::orders::order_routes())
        // Payments API
        .nest("/payments", handlers::payments::payment_routes())
        .merge(payment_webhook)
        // OpenAPI document
        .merge(openapi::openapi_routes())
}

async fn api_status() -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    let version = env!("CARGO_PKG_VERSION");
    let status_data = json!({
        "status": "ok",
        "version": version,
        "service": "storefront-api",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "environment": std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
    });

    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, errors::ServiceError> {
    // Check database connectivity
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    // Check Redis connectivity
    let redis_status = match state.redis.get_async_connection().await {
        Ok(mut conn) => match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(_) => "healthy",
            Err(_) => "unhealthy",
        },
        Err(_) => "unhealthy",
    };

    let health_data = json!({
        "status": if db_status == "healthy" { "healthy" } else { "unhealthy" },
        "checks": {
            "database": db_status,
            "cache": redis_status,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(health_data)))
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-err"), async {
                ApiResponse::<()>::error("oops".into())
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-err"));
        assert!(!meta.timestamp.is_empty());
    }
}

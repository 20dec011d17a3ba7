use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing::{error, info};

use storefront_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("loading configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("connecting to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    // Init Redis client (construction only; connection checked in health)
    let redis_client =
        Arc::new(redis::Client::open(cfg.redis_url.clone()).context("creating redis client")?);

    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Payment gateway client
    let gateway: Arc<dyn api::gateway::PaymentGateway> = Arc::new(api::gateway::RazorpayClient::new(
        cfg.razorpay_base_url.clone(),
        cfg.razorpay_key_id.clone(),
        cfg.razorpay_key_secret.clone(),
        Duration::from_secs(cfg.gateway_fetch_timeout_secs),
    )?);

    // Notification gateway (external renderer/sender); disabled when no
    // endpoint is configured
    let notifier: Arc<dyn api::services::notifications::NotificationGateway> =
        match cfg.notification_url.clone() {
            Some(url) => {
                info!("Transactional notifications enabled");
                Arc::new(api::services::notifications::HttpNotifier::new(
                    url,
                    cfg.notification_secret.clone(),
                )?)
            }
            None => {
                info!("Notification endpoint not configured; notifications disabled");
                Arc::new(api::services::notifications::NullNotifier)
            }
        };

    // Aggregate app services used by HTTP handlers
    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        gateway,
        notifier,
        api::services::payments::PaymentCredentials {
            key_secret: cfg.razorpay_key_secret.clone(),
            webhook_secret: cfg.razorpay_webhook_secret.clone(),
        },
    );

    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        event_sender,
        services,
        redis: redis_client.clone(),
    };

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.should_allow_permissive_cors() {
        info!("Using permissive CORS (no explicit origins configured)");
        CorsLayer::permissive()
    } else {
        error!("Missing CORS configuration; set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true");
        anyhow::bail!(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
        );
    };

    let app = Router::<api::AppState>::new()
        .route("/", axum::routing::get(|| async { "storefront-api up" }))
        .nest("/api/v1", api::api_v1_routes())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(api::tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(cors_layer)
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            api::tracing::request_id_middleware,
        ))
        .with_state(app_state);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("storefront-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

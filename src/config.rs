use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use tracing::info;
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DB_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 8;
const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.razorpay.com/v1";
const DEFAULT_GATEWAY_FETCH_TIMEOUT_SECS: u64 = 10;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL (webhook replay dedup)
    pub redis_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Payment gateway REST base URL
    #[serde(default = "default_gateway_base_url")]
    pub razorpay_base_url: String,

    /// Payment gateway API key id (basic-auth user)
    pub razorpay_key_id: String,

    /// Payment gateway API key secret; also signs the synchronous
    /// verification payload
    #[validate(length(min = 8), custom = "validate_secret")]
    pub razorpay_key_secret: String,

    /// Separate secret for webhook body signatures
    #[validate(length(min = 8), custom = "validate_secret")]
    pub razorpay_webhook_secret: String,

    /// Bounded timeout for the gateway payment-fetch call (seconds)
    #[serde(default = "default_gateway_fetch_timeout_secs")]
    pub gateway_fetch_timeout_secs: u64,

    /// Transactional notification service endpoint; notifications are
    /// disabled when unset
    #[serde(default)]
    pub notification_url: Option<String>,

    /// Optional shared secret for signing outbound notifications
    #[serde(default)]
    pub notification_secret: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_db_connect_timeout_secs() -> u64 {
    DEFAULT_DB_CONNECT_TIMEOUT_SECS
}

fn default_db_idle_timeout_secs() -> u64 {
    DEFAULT_DB_IDLE_TIMEOUT_SECS
}

fn default_db_acquire_timeout_secs() -> u64 {
    DEFAULT_DB_ACQUIRE_TIMEOUT_SECS
}

fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}

fn default_gateway_fetch_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_FETCH_TIMEOUT_SECS
}

fn validate_secret(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("secret");
        err.message = Some("secret must not be blank".into());
        return Err(err);
    }
    Ok(())
}

impl AppConfig {
    /// Construct a configuration directly; used by tests and tooling that
    /// bypass the file/environment loader.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        database_url: String,
        redis_url: String,
        host: String,
        port: u16,
        environment: String,
        razorpay_key_id: String,
        razorpay_key_secret: String,
        razorpay_webhook_secret: String,
    ) -> Self {
        Self {
            database_url,
            redis_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            razorpay_base_url: default_gateway_base_url(),
            razorpay_key_id,
            razorpay_key_secret,
            razorpay_webhook_secret,
            gateway_fetch_timeout_secs: default_gateway_fetch_timeout_secs(),
            notification_url: None,
            notification_secret: None,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
            || self.environment.eq_ignore_ascii_case("dev")
            || self.environment.eq_ignore_ascii_case("test")
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.cors_allow_any_origin || self.is_development()
    }
}

/// Loads configuration from `config/{default,<env>}.toml` plus `APP__*`
/// environment overrides, then validates it.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder();

    let default_path = Path::new(CONFIG_DIR).join("default.toml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }
    let env_path = Path::new(CONFIG_DIR).join(format!("{}.toml", environment));
    if env_path.exists() {
        builder = builder.add_source(File::from(env_path));
    }

    let settings = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .set_default("environment", environment.clone())?
        .build()?;

    let app_config: AppConfig = settings.try_deserialize()?;
    app_config
        .validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {}", e)))?;

    info!(environment = %app_config.environment, "Configuration loaded");
    Ok(app_config)
}

/// Initializes the global tracing subscriber.
pub fn init_tracing(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

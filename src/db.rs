use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::gauge;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

/// Establishes a connection pool to the database with custom configuration
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());

    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(true);

    gauge!(
        "storefront_db.max_connections",
        config.max_connections as f64
    );

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt)
        .await
        .map_err(ServiceError::DatabaseError)?;

    Ok(db_pool)
}

/// Establishes a database connection pool from the application configuration
pub async fn establish_connection_from_app_config(
    config: &AppConfig,
) -> Result<DbPool, ServiceError> {
    let db_config = DbConfig {
        url: config.database_url.clone(),
        max_connections: config.db_max_connections,
        min_connections: config.db_min_connections,
        connect_timeout: Duration::from_secs(config.db_connect_timeout_secs),
        idle_timeout: Duration::from_secs(config.db_idle_timeout_secs),
        acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
    };

    establish_connection_with_config(&db_config).await
}

/// Applies all pending schema migrations
pub async fn run_migrations(db: &DatabaseConnection) -> Result<(), DbErr> {
    info!("Running database migrations");
    crate::migrator::Migrator::up(db, None).await?;
    info!("Database migrations complete");
    Ok(())
}

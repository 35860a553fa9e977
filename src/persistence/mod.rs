//! Persistence Layer
//!
//! SQLite storage for the trade ledger, via sqlx.
//!
//! # Database Schema
//!
//! ## trade_records
//! - seq: insertion order
//! - trade_id: unique id assigned by the ledger
//! - user_id, symbol, side ("buy" / "sell"), amount, price
//! - timestamp_ms: trade time, unix millis
//! - signals, signal_metrics, market_conditions: caller payloads (JSON text)
//! - pnl, status, related_trade_id, source, strategy_tag
//! - expires_at_ms: end of retention, unix millis
//!
//! ## user_summaries / user_risk_states
//! - user_id: primary key
//! - payload: JSON blob
//! - updated_at: Timestamp

pub mod memory;
pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradecore.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Log every statement at debug level
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradecore.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            log_queries: false,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Every connection to `sqlite::memory:` opens its own empty database, so an
/// in-memory pool is pinned to a single connection that is never recycled.
pub async fn init_database(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    let pool = if config.is_memory() {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?
    };

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trade_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            trade_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
            amount REAL NOT NULL,
            price REAL NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            signals TEXT NOT NULL,
            signal_metrics TEXT NOT NULL,
            market_conditions TEXT NOT NULL,
            pnl REAL NOT NULL DEFAULT 0.0,
            status TEXT NOT NULL,
            related_trade_id TEXT,
            source TEXT NOT NULL CHECK(source IN ('real', 'backtest')),
            strategy_tag TEXT,
            expires_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create trade_records table: {}", e))
    })?;

    for table in ["user_summaries", "user_risk_states"] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                user_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            table
        ))
        .execute(pool)
        .await
        .map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", table, e))
        })?;
    }

    for (name, column) in [
        ("idx_trade_records_symbol", "symbol"),
        ("idx_trade_records_user", "user_id"),
        ("idx_trade_records_expires", "expires_at_ms"),
    ] {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON trade_records({})",
            name, column
        ))
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

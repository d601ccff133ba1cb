//! SQLite 连接管理

use std::str::FromStr;
use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use strata_config::DatabaseConfig;
use strata_errors::{AppError, AppResult};
use tracing::info;

/// SQLite 连接池配置
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
    pub create_if_missing: bool,
    pub journal_mode: SqliteJournalMode,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            busy_timeout: Duration::from_secs(5),
            create_if_missing: true,
            journal_mode: SqliteJournalMode::Wal,
        }
    }
}

impl SqliteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 从应用配置转换
    pub fn from_database_config(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.expose_secret().clone(),
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            busy_timeout: Duration::from_secs(config.busy_timeout_secs),
            create_if_missing: config.create_if_missing,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_journal_mode(mut self, mode: SqliteJournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    fn connect_options(&self) -> AppResult<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(&self.url)
            .map_err(|e| AppError::configuration(format!("Invalid SQLite url: {}", e)))?;

        Ok(options
            .create_if_missing(self.create_if_missing)
            .busy_timeout(self.busy_timeout)
            .journal_mode(self.journal_mode)
            .foreign_keys(true))
    }
}

/// 创建 SQLite 连接池
pub async fn create_pool(config: &SqliteConfig) -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect_with(config.connect_options()?)
        .await?;

    info!(max_connections = config.max_connections, "SQLite pool created");
    Ok(pool)
}

/// 检查数据库连接
pub async fn check_connection(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

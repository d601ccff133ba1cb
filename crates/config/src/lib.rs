//! strata-config - 配置加载库

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use strata_common::is_identifier;
use strata_errors::{AppError, AppResult};

/// 数据库配置
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
}

fn default_max_connections() -> u32 {
    // 开发环境: 5, 生产环境: 10
    match std::env::var("APP_ENV").as_deref() {
        Ok("production") => 10,
        _ => 5,
    }
}

fn default_min_connections() -> u32 {
    0
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Secret::new(url.into()),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            busy_timeout_secs: default_busy_timeout_secs(),
            create_if_missing: true,
        }
    }

    fn validate(&self) -> AppResult<()> {
        if self.url.expose_secret().trim().is_empty() {
            return Err(AppError::configuration("database.url must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(AppError::configuration(
                "database.max_connections must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(AppError::configuration(
                "database.min_connections must not exceed max_connections",
            ));
        }
        Ok(())
    }
}

/// 审计配置
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_table")]
    pub table_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_audit_table() -> String {
    "audit_changes".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            table_name: default_audit_table(),
            enabled: true,
        }
    }
}

impl AuditConfig {
    fn validate(&self) -> AppResult<()> {
        if !is_identifier(&self.table_name) {
            return Err(AppError::configuration(format!(
                "audit.table_name `{}` is not a valid identifier",
                self.table_name
            )));
        }
        Ok(())
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_env")]
    pub app_env: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_app_env() -> String {
    "development".to_string()
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 合并顺序：`default.toml` → `<APP_ENV>.toml` → `STRATA_` 前缀环境变量
    /// （嵌套字段使用 `__` 分隔，例如 `STRATA_DATABASE__URL`）
    pub fn load(config_dir: &str) -> AppResult<Self> {
        dotenvy::dotenv().ok();
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let figment = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("STRATA_").split("__"));

        Self::from_figment(figment)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| AppError::configuration(format!("Failed to load config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.database.validate()?;
        self.audit.validate()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// 是否为开发环境
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

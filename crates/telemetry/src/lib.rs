//! telemetry - 可观测性库
//!
//! tracing 初始化与数据访问层的 metrics 记录

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use strata_config::TelemetryConfig;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化 tracing
///
/// 已存在全局 subscriber 时返回 `false`
pub fn init_tracing(log_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// 初始化 JSON 格式的 tracing（生产环境）
pub fn init_tracing_json(log_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}

/// 按配置初始化 tracing：`json = true` 时输出 JSON
pub fn init_tracing_from_config(config: &TelemetryConfig) -> bool {
    if config.json {
        init_tracing_json(&config.log_level)
    } else {
        init_tracing(&config.log_level)
    }
}

/// 测试用 tracing（输出到测试捕获的 writer）
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// 初始化 Prometheus metrics
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// 记录数据库操作
pub fn record_db_operation(operation: &str, table: &str, duration_ms: f64, success: bool) {
    let labels = [
        ("operation", operation.to_string()),
        ("table", table.to_string()),
        ("success", success.to_string()),
    ];

    counter!("strata_db_operations_total", &labels).increment(1);
    histogram!("strata_db_operation_duration_ms", &labels).record(duration_ms);
}

/// 记录一次提交
pub fn record_commit(entries: usize, audit_records: usize, success: bool) {
    let labels = [("success", success.to_string())];

    counter!("strata_commits_total", &labels).increment(1);
    if success {
        counter!("strata_committed_entries_total").increment(entries as u64);
        counter!("strata_audit_records_total").increment(audit_records as u64);
    }
}

/// 记录批量操作
pub fn record_bulk_operation(operation: &str, table: &str, rows: u64) {
    let labels = [
        ("operation", operation.to_string()),
        ("table", table.to_string()),
    ];

    counter!("strata_bulk_operations_total", &labels).increment(1);
    counter!("strata_bulk_rows_total", &labels).increment(rows);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_installed_exporter() {
        // 未安装 recorder 时为 no-op
        record_db_operation("select", "teachers", 1.5, true);
        record_commit(2, 2, true);
        record_bulk_operation("insert", "teachers", 10);
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_test_tracing();
        assert!(!init_tracing("info"));
    }

    #[test]
    fn test_init_from_config_honours_existing_subscriber() {
        init_test_tracing();

        let json = TelemetryConfig {
            log_level: "debug".to_string(),
            json: true,
        };
        assert!(!init_tracing_from_config(&json));
        assert!(!init_tracing_from_config(&TelemetryConfig::default()));
    }
}

//! 快照序列化端口

use serde_json::{Map, Value};
use strata_errors::{AppError, AppResult};

use crate::FieldMap;

/// 审计快照序列化器
///
/// 输出必须确定：同一映射总是得到同一字符串
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait SnapshotSerializer: Send + Sync {
    /// 序列化字段映射，`table` 仅用于错误上下文
    fn serialize(&self, table: &str, fields: &FieldMap) -> AppResult<String>;

    fn deserialize(&self, table: &str, text: &str) -> AppResult<FieldMap>;
}

/// JSON 序列化器，嵌套对象的键按字典序输出
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSnapshotSerializer;

impl SnapshotSerializer for JsonSnapshotSerializer {
    fn serialize(&self, table: &str, fields: &FieldMap) -> AppResult<String> {
        let canonical: Map<String, Value> = fields
            .iter()
            .map(|(name, value)| (name.clone(), canonicalize(value)))
            .collect();

        serde_json::to_string(&canonical).map_err(|e| AppError::serialization(table, "snapshot", e))
    }

    fn deserialize(&self, table: &str, text: &str) -> AppResult<FieldMap> {
        serde_json::from_str(text).map_err(|e| AppError::serialization(table, "snapshot", e))
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

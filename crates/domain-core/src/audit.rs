//! 审计变更记录

use std::str::FromStr;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strata_common::new_id;
use strata_errors::{AppError, AppResult};
use uuid::Uuid;

use crate::{FieldMap, SnapshotSerializer};

/// 变更动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum AuditAction {
    Added,
    Modified,
    Deleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Added => "Added",
            AuditAction::Modified => "Modified",
            AuditAction::Deleted => "Deleted",
        }
    }
}

impl FromStr for AuditAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Added" => Ok(AuditAction::Added),
            "Modified" => Ok(AuditAction::Modified),
            "Deleted" => Ok(AuditAction::Deleted),
            other => Err(AppError::invalid_argument(format!(
                "unknown audit action `{}`",
                other
            ))),
        }
    }
}

impl TryFrom<String> for AuditAction {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 审计变更记录
///
/// 每个被跟踪实体每次提交恰好一条，写入后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AuditChangeRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub table_name: String,
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub action: AuditAction,
    pub keys: String,
    /// 插入时为空
    pub previous_state: Option<String>,
    /// 删除时为空
    pub new_state: Option<String>,
}

impl AuditChangeRecord {
    /// 由字段映射构建记录，空映射整体省略
    pub fn new(
        created_at: DateTime<Utc>,
        table_name: impl Into<String>,
        action: AuditAction,
        keys: &FieldMap,
        previous: &FieldMap,
        current: &FieldMap,
        serializer: &dyn SnapshotSerializer,
    ) -> AppResult<Self> {
        let table_name = table_name.into();
        let keys = serializer.serialize(&table_name, keys)?;
        let previous_state = serialize_non_empty(serializer, &table_name, previous)?;
        let new_state = serialize_non_empty(serializer, &table_name, current)?;

        Ok(Self {
            id: new_id(),
            created_at,
            table_name,
            action,
            keys,
            previous_state,
            new_state,
        })
    }

    pub fn keys_map(&self, serializer: &dyn SnapshotSerializer) -> AppResult<FieldMap> {
        serializer.deserialize(&self.table_name, &self.keys)
    }

    pub fn previous_map(&self, serializer: &dyn SnapshotSerializer) -> AppResult<Option<FieldMap>> {
        self.previous_state
            .as_deref()
            .map(|text| serializer.deserialize(&self.table_name, text))
            .transpose()
    }

    pub fn new_map(&self, serializer: &dyn SnapshotSerializer) -> AppResult<Option<FieldMap>> {
        self.new_state
            .as_deref()
            .map(|text| serializer.deserialize(&self.table_name, text))
            .transpose()
    }
}

fn serialize_non_empty(
    serializer: &dyn SnapshotSerializer,
    table: &str,
    fields: &FieldMap,
) -> AppResult<Option<String>> {
    if fields.is_empty() {
        return Ok(None);
    }
    serializer.serialize(table, fields).map(Some)
}

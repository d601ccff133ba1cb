//! 审计表读取
//!
//! 审计记录由拦截器在提交事务中写入，这里只负责建表与查询。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use strata_common::is_identifier;
use strata_domain_core::{AuditAction, AuditChangeRecord, FieldMap, SnapshotSerializer};
use strata_errors::{AppError, AppResult};
use tracing::info;

use crate::sql::quote;

/// 创建审计表（已存在时不做任何事）
pub async fn ensure_audit_table(pool: &SqlitePool, table: &str) -> AppResult<()> {
    if !is_identifier(table) {
        return Err(AppError::configuration(format!(
            "audit table `{}` is not a valid identifier",
            table
        )));
    }

    let create = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id BLOB PRIMARY KEY NOT NULL,
            created_at TEXT NOT NULL,
            table_name TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('Added', 'Modified', 'Deleted')),
            keys TEXT NOT NULL,
            previous_state TEXT,
            new_state TEXT
        )
        "#,
        table = quote(table)
    );
    sqlx::query(&create).execute(pool).await?;

    let index = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (table_name, keys)",
        quote(&format!("idx_{}_entity", table)),
        quote(table)
    );
    sqlx::query(&index).execute(pool).await?;

    info!(table, "Audit table ready");
    Ok(())
}

/// 审计记录过滤条件
#[derive(Debug, Clone, Default)]
pub struct AuditRecordFilter {
    pub table_name: Option<String>,
    pub action: Option<AuditAction>,
    /// 序列化后的主键映射，精确匹配
    pub keys: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_until: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl AuditRecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = Some(keys.into());
        self
    }

    /// 创建时间区间，包含两端
    pub fn created_between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn push_where(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        let mut separator = " WHERE ";
        let mut next = |qb: &mut QueryBuilder<'static, Sqlite>, clause: &str| {
            qb.push(separator);
            qb.push(clause);
            separator = " AND ";
        };

        if let Some(table) = &self.table_name {
            next(qb, "table_name = ");
            qb.push_bind(table.clone());
        }
        if let Some(action) = self.action {
            next(qb, "action = ");
            qb.push_bind(action.as_str());
        }
        if let Some(keys) = &self.keys {
            next(qb, "keys = ");
            qb.push_bind(keys.clone());
        }
        if let Some(from) = self.created_from {
            next(qb, "created_at >= ");
            qb.push_bind(from);
        }
        if let Some(until) = self.created_until {
            next(qb, "created_at <= ");
            qb.push_bind(until);
        }
    }
}

/// 审计记录读取器
#[derive(Clone)]
pub struct AuditTrail {
    pool: SqlitePool,
    table: String,
    serializer: Arc<dyn SnapshotSerializer>,
}

impl AuditTrail {
    pub fn new(
        pool: SqlitePool,
        table: impl Into<String>,
        serializer: Arc<dyn SnapshotSerializer>,
    ) -> Self {
        Self {
            pool,
            table: table.into(),
            serializer,
        }
    }

    /// 按写入顺序列出记录
    pub async fn list(&self, filter: &AuditRecordFilter) -> AppResult<Vec<AuditChangeRecord>> {
        let mut qb = QueryBuilder::new(
            "SELECT id, created_at, table_name, action, keys, previous_state, new_state FROM ",
        );
        qb.push(quote(&self.table));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let records = qb
            .build_query_as::<AuditChangeRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    pub async fn count(&self, filter: &AuditRecordFilter) -> AppResult<i64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM ");
        qb.push(quote(&self.table));
        filter.push_where(&mut qb);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// 某个实体的全部记录
    pub async fn for_entity(
        &self,
        table: &str,
        keys: &FieldMap,
    ) -> AppResult<Vec<AuditChangeRecord>> {
        let keys = self.serializer.serialize(table, keys)?;
        self.list(&AuditRecordFilter::new().table(table).keys(keys))
            .await
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("table", &self.table)
            .finish()
    }
}

//! 审计拦截器
//!
//! 提交事务的第一条语句之前为待写入实体写时间戳；业务语句执行完、
//! 生成主键回填之后，把每个待写入变更转换为审计记录，在同一事务中写入审计表。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqliteConnection};
use strata_common::{Clock, SystemClock, is_identifier};
use strata_config::AuditConfig;
use strata_domain_core::{AuditChangeRecord, JsonSnapshotSerializer, SnapshotSerializer};
use strata_errors::{AppError, AppResult};
use tracing::debug;

use crate::sql::quote;
use crate::tracker::{ChangeTracker, PendingMutation};

/// SQLite 单条语句的参数上限为 32766，每条审计记录 7 个参数
const RECORDS_PER_STATEMENT: usize = 500;

/// 审计拦截器
pub struct AuditInterceptor {
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn SnapshotSerializer>,
    table: String,
    enabled: bool,
}

impl AuditInterceptor {
    pub fn new(
        clock: Arc<dyn Clock>,
        serializer: Arc<dyn SnapshotSerializer>,
        config: &AuditConfig,
    ) -> AppResult<Self> {
        if !is_identifier(&config.table_name) {
            return Err(AppError::configuration(format!(
                "audit table `{}` is not a valid identifier",
                config.table_name
            )));
        }
        Ok(Self {
            clock,
            serializer,
            table: config.table_name.clone(),
            enabled: config.enabled,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn serializer(&self) -> &Arc<dyn SnapshotSerializer> {
        &self.serializer
    }

    /// 写时间戳，返回本次提交使用的时间
    pub(crate) fn stamp(&self, tracker: &mut ChangeTracker) -> AppResult<DateTime<Utc>> {
        let now = self.clock.now();
        tracker.stamp_pending(now)?;
        Ok(now)
    }

    /// 构建审计记录；任一字段序列化失败则整体失败
    pub fn capture(
        &self,
        mutations: &[PendingMutation],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<AuditChangeRecord>> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        mutations
            .iter()
            .filter(|m| m.audited)
            .map(|m| {
                AuditChangeRecord::new(
                    now,
                    m.table,
                    m.action,
                    &m.keys(),
                    &m.previous_state(),
                    &m.new_state(),
                    self.serializer.as_ref(),
                )
            })
            .collect()
    }

    /// 在调用方的事务中写入审计记录
    pub(crate) async fn persist(
        &self,
        conn: &mut SqliteConnection,
        records: &[AuditChangeRecord],
    ) -> AppResult<()> {
        for chunk in records.chunks(RECORDS_PER_STATEMENT) {
            let mut qb = QueryBuilder::new("INSERT INTO ");
            qb.push(quote(&self.table));
            qb.push(
                " (id, created_at, table_name, action, keys, previous_state, new_state) ",
            );
            qb.push_values(chunk, |mut row, record| {
                row.push_bind(record.id)
                    .push_bind(record.created_at)
                    .push_bind(record.table_name.clone())
                    .push_bind(record.action.as_str())
                    .push_bind(record.keys.clone())
                    .push_bind(record.previous_state.clone())
                    .push_bind(record.new_state.clone());
            });
            qb.build().execute(&mut *conn).await?;
        }

        if !records.is_empty() {
            debug!(table = %self.table, audit_records = records.len(), "Audit records written");
        }
        Ok(())
    }
}

impl Default for AuditInterceptor {
    fn default() -> Self {
        let config = AuditConfig::default();
        Self {
            clock: Arc::new(SystemClock),
            serializer: Arc::new(JsonSnapshotSerializer),
            table: config.table_name,
            enabled: config.enabled,
        }
    }
}

impl std::fmt::Debug for AuditInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditInterceptor")
            .field("table", &self.table)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Note, note};
    use chrono::TimeZone;
    use strata_common::MockClock;
    use strata_domain_core::{AuditAction, Entity, MockSnapshotSerializer};
    use strata_errors::ErrorKind;

    fn fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn interceptor_with(
        clock: impl Clock + 'static,
        serializer: impl SnapshotSerializer + 'static,
    ) -> AuditInterceptor {
        AuditInterceptor::new(Arc::new(clock), Arc::new(serializer), &AuditConfig::default())
            .unwrap()
    }

    #[test]
    fn test_rejects_invalid_table_name() {
        let config = AuditConfig {
            table_name: "audit changes".to_string(),
            enabled: true,
        };
        let err = AuditInterceptor::new(
            Arc::new(SystemClock),
            Arc::new(JsonSnapshotSerializer),
            &config,
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_stamp_uses_injected_clock() {
        let mut clock = MockClock::new();
        clock.expect_now().times(1).return_const(fixed());
        let interceptor = interceptor_with(clock, JsonSnapshotSerializer);

        let mut tracker = ChangeTracker::new();
        let tracked = tracker
            .add(&Arc::new(Note::describe()), note("n1", "hi"))
            .unwrap();

        let now = interceptor.stamp(&mut tracker).unwrap();

        assert_eq!(now, fixed());
        assert_eq!(tracked.timestamps().created_at, Some(fixed()));
        assert_eq!(tracked.timestamps().modified_at, None);
    }

    #[test]
    fn test_capture_builds_one_record_per_mutation() {
        let interceptor = interceptor_with(SystemClock, JsonSnapshotSerializer);
        let descriptor = Arc::new(Note::describe());
        let mut tracker = ChangeTracker::new();
        tracker.add(&descriptor, note("n1", "hi")).unwrap();
        let gone = note("n2", "bye");
        tracker.attach(&descriptor, gone.clone()).unwrap();
        tracker.remove(&descriptor, &gone).unwrap();
        tracker.stamp_pending(fixed()).unwrap();

        let records = interceptor
            .capture(&tracker.pending_mutations().unwrap(), fixed())
            .unwrap();

        assert_eq!(records.len(), 2);
        let insert = &records[0];
        assert_eq!(insert.action, AuditAction::Added);
        assert_eq!(insert.table_name, "notes");
        assert_eq!(insert.keys, r#"{"id":"n1"}"#);
        assert_eq!(insert.previous_state, None);
        assert_eq!(insert.created_at, fixed());

        let delete = &records[1];
        assert_eq!(delete.action, AuditAction::Deleted);
        assert_eq!(delete.new_state, None);
        assert!(delete.previous_state.as_deref().unwrap().contains(r#""body":"bye""#));
    }

    #[test]
    fn test_disabled_interceptor_captures_nothing() {
        let config = AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        };
        let interceptor = AuditInterceptor::new(
            Arc::new(SystemClock),
            Arc::new(JsonSnapshotSerializer),
            &config,
        )
        .unwrap();
        let mut tracker = ChangeTracker::new();
        tracker
            .add(&Arc::new(Note::describe()), note("n1", "hi"))
            .unwrap();

        let records = interceptor
            .capture(&tracker.pending_mutations().unwrap(), fixed())
            .unwrap();

        assert!(records.is_empty());
    }

    #[test]
    fn test_serialization_failure_fails_capture() {
        let mut serializer = MockSnapshotSerializer::new();
        serializer.expect_serialize().returning(|table, _| {
            let source = serde_json::from_str::<serde_json::Value>("]").unwrap_err();
            Err(AppError::serialization(table, "body", source))
        });
        let interceptor = interceptor_with(SystemClock, serializer);
        let mut tracker = ChangeTracker::new();
        tracker
            .add(&Arc::new(Note::describe()), note("n1", "hi"))
            .unwrap();

        let err = interceptor
            .capture(&tracker.pending_mutations().unwrap(), fixed())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}

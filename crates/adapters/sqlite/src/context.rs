//! 数据库上下文
//!
//! 一个上下文独占一条（按需打开的）连接、可选的环境事务以及变更跟踪器。
//! 仓储与 Store 只持有对上下文的弱引用，上下文释放后其调用返回 `ContextDisposed`。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use strata_common::{Clock, SystemClock};
use strata_config::AuditConfig;
use strata_domain_core::{
    AuditAction, AuditChangeRecord, Entity, EntityDescriptor, JsonSnapshotSerializer,
    ModelRegistry, SnapshotSerializer,
};
use strata_errors::{AppError, AppResult};
use strata_ports::{CommitSummary, Condition};
use strata_telemetry::record_commit;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit_log::AuditTrail;
use crate::bulk::{ConnectionSlot, TransactionScope};
use crate::interceptor::AuditInterceptor;
use crate::sql;
use crate::tracker::{ChangeTracker, PendingMutation, TrackerCheckpoint};
use crate::transaction::{ConnectionState, TransactionBehavior, TransactionInfo};

/// 上下文的可变状态，由一把异步锁串行化
#[derive(Default)]
pub(crate) struct ContextState {
    pub(crate) slot: ConnectionSlot,
    pub(crate) tracker: ChangeTracker,
}

pub(crate) struct ContextInner {
    pool: SqlitePool,
    registry: Arc<ModelRegistry>,
    interceptor: AuditInterceptor,
    cancel: CancellationToken,
    closed: AtomicBool,
    state: Mutex<ContextState>,
}

/// 数据库上下文
#[derive(Clone)]
pub struct DbContext {
    inner: Arc<ContextInner>,
}

/// 上下文构建器
pub struct DbContextBuilder {
    pool: SqlitePool,
    registry: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn SnapshotSerializer>,
    audit: AuditConfig,
    cancel: CancellationToken,
}

impl DbContextBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn SnapshotSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_audit_config(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> AppResult<DbContext> {
        let interceptor = AuditInterceptor::new(self.clock, self.serializer, &self.audit)?;
        Ok(DbContext {
            inner: Arc::new(ContextInner {
                pool: self.pool,
                registry: self.registry,
                interceptor,
                cancel: self.cancel,
                closed: AtomicBool::new(false),
                state: Mutex::new(ContextState::default()),
            }),
        })
    }
}

impl DbContext {
    pub fn builder(pool: SqlitePool, registry: Arc<ModelRegistry>) -> DbContextBuilder {
        DbContextBuilder {
            pool,
            registry,
            clock: Arc::new(SystemClock),
            serializer: Arc::new(JsonSnapshotSerializer),
            audit: AuditConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn interceptor(&self) -> &AuditInterceptor {
        &self.inner.interceptor
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// 注入时钟的当前时间
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.interceptor.clock().now()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn descriptor<E: Entity>(&self) -> AppResult<Arc<EntityDescriptor<E>>> {
        self.inner.registry.descriptor::<E>()
    }

    /// 审计表读取器
    pub fn audit_trail(&self) -> AuditTrail {
        AuditTrail::new(
            self.inner.pool.clone(),
            self.inner.interceptor.table(),
            Arc::clone(self.inner.interceptor.serializer()),
        )
    }

    pub(crate) fn downgrade(&self) -> ContextRef {
        ContextRef(Arc::downgrade(&self.inner))
    }

    pub(crate) fn ensure_active(&self, operation: &str) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ContextDisposed);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(AppError::cancelled(operation.to_string()));
        }
        Ok(())
    }

    pub(crate) async fn lock(&self) -> AppResult<MutexGuard<'_, ContextState>> {
        let state = self.inner.state.lock().await;
        if self.is_closed() {
            return Err(AppError::ContextDisposed);
        }
        Ok(state)
    }

    /// 与取消信号竞争执行
    pub(crate) async fn guard<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        self.ensure_active(operation)?;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(AppError::cancelled(operation.to_string())),
            result = fut => result,
        }
    }

    /// 开始显式事务；连接未打开时一并打开，事务结束时关闭
    pub async fn begin_transaction(
        &self,
        behavior: TransactionBehavior,
    ) -> AppResult<TransactionInfo> {
        self.ensure_active("begin_transaction")?;
        let now = self.now();
        let mut state = self.lock().await?;
        let info = state.slot.begin(&self.inner.pool, behavior, now).await?;
        info!(transaction_id = %info.id, behavior = ?behavior, "Explicit transaction started");
        Ok(info)
    }

    pub async fn commit_transaction(&self) -> AppResult<()> {
        let mut state = self.lock().await?;
        state.slot.commit().await?;
        info!("Explicit transaction committed");
        Ok(())
    }

    /// 回滚显式事务；事务内已保存的变更随之作废，跟踪器被清空
    pub async fn rollback_transaction(&self) -> AppResult<()> {
        let mut state = self.lock().await?;
        state.slot.rollback().await?;
        state.tracker.clear();
        info!("Explicit transaction rolled back");
        Ok(())
    }

    pub async fn open_connection(&self) -> AppResult<()> {
        self.ensure_active("open_connection")?;
        let mut state = self.lock().await?;
        state.slot.open(&self.inner.pool).await?;
        Ok(())
    }

    pub async fn close_connection(&self) -> AppResult<()> {
        let mut state = self.lock().await?;
        state.slot.close()
    }

    pub async fn connection_state(&self) -> AppResult<ConnectionState> {
        let state = self.lock().await?;
        Ok(if state.slot.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        })
    }

    pub async fn in_transaction(&self) -> AppResult<bool> {
        Ok(self.lock().await?.slot.in_transaction())
    }

    pub async fn has_changes(&self) -> AppResult<bool> {
        Ok(self.lock().await?.tracker.has_changes())
    }

    /// 丢弃全部暂存变更与已跟踪的实体
    pub async fn discard_changes(&self) -> AppResult<()> {
        let mut state = self.lock().await?;
        let discarded = state.tracker.len();
        state.tracker.clear();
        debug!(entries = discarded, "Tracked changes discarded");
        Ok(())
    }

    pub(crate) async fn tracker_checkpoint(&self) -> AppResult<TrackerCheckpoint> {
        Ok(self.lock().await?.tracker.checkpoint())
    }

    /// 跟踪器回到检查点，之后暂存的变更被撤销
    pub(crate) async fn restore_tracker(&self, checkpoint: TrackerCheckpoint) -> AppResult<()> {
        let mut state = self.lock().await?;
        let kept = checkpoint.len();
        state.tracker.restore(checkpoint);
        debug!(entries = kept, "Tracked changes restored to checkpoint");
        Ok(())
    }

    /// 原子地写入全部暂存变更及其审计记录
    ///
    /// 取消信号只在事务开始前检查；事务开始后的取消由引擎决定，
    /// 不保证干净回滚。存在环境事务时在其中执行且不提交。
    pub async fn save_changes(&self) -> AppResult<CommitSummary> {
        self.ensure_active("save_changes")?;
        let mut state = self.lock().await?;
        let ContextState { slot, tracker } = &mut *state;

        let result = self.inner.save(slot, tracker).await;
        match &result {
            Ok(summary) => {
                if !summary.is_empty() {
                    record_commit(summary.entries(), summary.audit_records, true);
                    info!(
                        added = summary.added,
                        modified = summary.modified,
                        deleted = summary.deleted,
                        audit_records = summary.audit_records,
                        "Changes saved"
                    );
                }
            }
            Err(e) => {
                record_commit(0, 0, false);
                warn!(error = %e, "Saving changes failed");
            }
        }
        result
    }

    /// 释放上下文：回滚未结束的事务、归还连接、清空跟踪器
    pub async fn close(&self) -> AppResult<()> {
        let mut state = self.inner.state.lock().await;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        state.tracker.clear();
        let result = state.slot.reset().await;
        debug!("Database context closed");
        result
    }
}

impl std::fmt::Debug for DbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("registry", &self.inner.registry)
            .field("interceptor", &self.inner.interceptor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ContextInner {
    async fn save(
        &self,
        slot: &mut ConnectionSlot,
        tracker: &mut ChangeTracker,
    ) -> AppResult<CommitSummary> {
        let now = self.interceptor.stamp(tracker)?;
        let mut mutations = tracker.pending_mutations()?;
        if mutations.is_empty() {
            return Ok(CommitSummary::default());
        }

        let mut scope =
            TransactionScope::begin(slot, &self.pool, TransactionBehavior::Immediate).await?;

        let records = match self.apply(&mut scope, tracker, &mut mutations, now).await {
            Ok(records) => records,
            Err(e) => {
                if let Err(rollback) = scope.abort().await {
                    warn!(error = %rollback, "Rollback after failed save failed");
                }
                tracker.reset_generated_keys();
                return Err(e);
            }
        };

        if let Err(e) = scope.complete().await {
            tracker.reset_generated_keys();
            return Err(e);
        }
        tracker.accept_all()?;

        let mut summary = CommitSummary {
            audit_records: records.len(),
            ..CommitSummary::default()
        };
        for mutation in &mutations {
            match mutation.action {
                AuditAction::Added => summary.added += 1,
                AuditAction::Modified => summary.modified += 1,
                AuditAction::Deleted => summary.deleted += 1,
            }
        }
        Ok(summary)
    }

    /// 按暂存顺序执行业务语句，回填生成主键，最后写入审计记录
    async fn apply(
        &self,
        scope: &mut TransactionScope<'_>,
        tracker: &mut ChangeTracker,
        mutations: &mut [PendingMutation],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<AuditChangeRecord>> {
        for mutation in mutations.iter_mut() {
            match mutation.action {
                AuditAction::Added => {
                    let mut qb = sql::insert(mutation.table, &mutation.insert_columns())?;
                    let result = qb.build().execute(scope.connection()?).await?;
                    if mutation.has_temporary_values() {
                        let generated = Value::from(result.last_insert_rowid());
                        tracker.resolve_generated_key(mutation.entry, &generated)?;
                        mutation.resolve_temporary(generated);
                    }
                }
                AuditAction::Modified => {
                    let key = mutation_key(mutation)?;
                    let mut qb = sql::update(
                        mutation.table,
                        &mutation.written_columns(),
                        mutation.key_column,
                        &key,
                    )?;
                    let result = qb.build().execute(scope.connection()?).await?;
                    ensure_affected(result.rows_affected(), mutation, &key)?;
                }
                AuditAction::Deleted => {
                    let key = mutation_key(mutation)?;
                    let mut qb = sql::delete_where(
                        mutation.table,
                        &[Condition::eq(mutation.key_column, key.clone())],
                    )?;
                    let result = qb.build().execute(scope.connection()?).await?;
                    ensure_affected(result.rows_affected(), mutation, &key)?;
                }
            }
        }

        let records = self.interceptor.capture(mutations, now)?;
        self.interceptor
            .persist(scope.connection()?, &records)
            .await?;
        Ok(records)
    }
}

fn mutation_key(mutation: &PendingMutation) -> AppResult<Value> {
    mutation
        .key()
        .map(|p| p.current.clone())
        .ok_or_else(|| AppError::internal(format!("mutation on `{}` has no key", mutation.table)))
}

/// 更新 / 删除未命中任何行视为并发冲突
fn ensure_affected(rows: u64, mutation: &PendingMutation, key: &Value) -> AppResult<()> {
    if rows == 0 {
        return Err(AppError::conflict(format!(
            "{} on `{}` affected no rows for key {}",
            mutation.action, mutation.table, key
        )));
    }
    Ok(())
}

/// 对上下文的非拥有引用
#[derive(Clone)]
pub(crate) struct ContextRef(Weak<ContextInner>);

impl ContextRef {
    pub(crate) fn upgrade(&self) -> AppResult<DbContext> {
        self.0
            .upgrade()
            .map(|inner| DbContext { inner })
            .ok_or(AppError::ContextDisposed)
    }
}

impl std::fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContextRef")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

//! 批量连接协调器
//!
//! 批量操作获取上下文的连接与事务：已有则借用，没有则自行创建并负责释放。
//! 借用的资源在释放时原样留给其所有者，绝不提交或关闭；
//! 借用环境事务时以 savepoint 包住本次语句，失败只撤销自己写入的部分。

use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use strata_errors::{AppError, AppResult};
use tracing::{debug, warn};

use crate::transaction::{
    COMMIT_SQL, ROLLBACK_SQL, Savepoint, TransactionBehavior, TransactionInfo,
};

/// 资源所有权
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Borrowed,
}

/// 带所有权标记的资源句柄
pub enum Lease<'a, R> {
    Owned(R),
    Borrowed(&'a mut R),
}

impl<'a, R> Lease<'a, R> {
    pub fn ownership(&self) -> Ownership {
        match self {
            Lease::Owned(_) => Ownership::Owned,
            Lease::Borrowed(_) => Ownership::Borrowed,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Lease::Owned(_))
    }

    /// 释放句柄：拥有的资源交回调用方处置，借用的资源保持不动
    pub fn release(self) -> Option<R> {
        match self {
            Lease::Owned(resource) => Some(resource),
            Lease::Borrowed(_) => None,
        }
    }
}

impl<R> Deref for Lease<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        match self {
            Lease::Owned(resource) => resource,
            Lease::Borrowed(resource) => resource,
        }
    }
}

impl<R> DerefMut for Lease<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        match self {
            Lease::Owned(resource) => resource,
            Lease::Borrowed(resource) => resource,
        }
    }
}

/// 被丢弃的作用域留下的待撤销工作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingUndo {
    /// 借用连接上未完成的自有事务
    Transaction,
    /// 环境事务内未释放的 savepoint
    Savepoint,
}

/// 上下文持有的连接及其环境事务
#[derive(Default)]
pub(crate) struct ConnectionSlot {
    pub(crate) connection: Option<PoolConnection<Sqlite>>,
    pub(crate) transaction: Option<TransactionInfo>,
    /// 下次使用连接前先撤销
    pub(crate) pending_undo: Option<PendingUndo>,
}

impl ConnectionSlot {
    pub(crate) fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// 单条语句使用的连接：已打开则借用，否则从连接池取出
    pub(crate) async fn lease(
        &mut self,
        pool: &SqlitePool,
    ) -> AppResult<Lease<'_, PoolConnection<Sqlite>>> {
        match self.connection.as_mut() {
            Some(conn) => {
                flush_pending_undo(conn, &mut self.pending_undo).await;
                Ok(Lease::Borrowed(conn))
            }
            None => Ok(Lease::Owned(pool.acquire().await?)),
        }
    }

    /// 打开连接，返回是否为本次新打开
    pub(crate) async fn open(&mut self, pool: &SqlitePool) -> AppResult<bool> {
        if self.connection.is_some() {
            return Ok(false);
        }
        self.connection = Some(pool.acquire().await?);
        debug!("Context connection opened");
        Ok(true)
    }

    /// 关闭连接（交还连接池）
    pub(crate) fn close(&mut self) -> AppResult<()> {
        if self.transaction.is_some() {
            debug_assert!(
                false,
                "closing a connection that an active transaction still uses"
            );
            return Err(AppError::invalid_operation(
                "cannot close the connection while a transaction is active",
            ));
        }
        if self.pending_undo.is_some() {
            self.discard_connection();
        } else if self.connection.take().is_some() {
            debug!("Context connection closed");
        }
        Ok(())
    }

    pub(crate) async fn begin(
        &mut self,
        pool: &SqlitePool,
        behavior: TransactionBehavior,
        started_at: DateTime<Utc>,
    ) -> AppResult<TransactionInfo> {
        if self.transaction.is_some() {
            return Err(AppError::invalid_operation(
                "a transaction is already active on this context",
            ));
        }

        let opened = self.open(pool).await?;
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| AppError::internal("connection missing after open"))?;
        flush_pending_undo(conn, &mut self.pending_undo).await;

        // BEGIN 执行期间被丢弃时，由延迟回滚收尾
        self.pending_undo = Some(PendingUndo::Transaction);
        let begun = sqlx::query(behavior.begin_sql()).execute(&mut **conn).await;
        self.pending_undo = None;
        if let Err(e) = begun {
            if opened {
                self.connection = None;
            }
            return Err(e.into());
        }

        let info = TransactionInfo::new(behavior, started_at, opened);
        debug!(transaction_id = %info.id, behavior = ?behavior, "Transaction started");
        self.transaction = Some(info.clone());
        Ok(info)
    }

    pub(crate) async fn commit(&mut self) -> AppResult<()> {
        self.finish(COMMIT_SQL).await
    }

    pub(crate) async fn rollback(&mut self) -> AppResult<()> {
        self.finish(ROLLBACK_SQL).await
    }

    async fn finish(&mut self, sql: &'static str) -> AppResult<()> {
        let info = self
            .transaction
            .as_ref()
            .ok_or_else(|| AppError::invalid_operation("no active transaction"))?;
        let conn = self.connection.as_mut().ok_or_else(|| {
            AppError::invalid_operation("transaction has lost its connection")
        })?;

        // 被丢弃的作用域写入的部分不得随环境事务提交
        flush_pending_undo(conn, &mut self.pending_undo).await;
        sqlx::query(sql).execute(&mut **conn).await?;
        debug!(transaction_id = %info.id, statement = sql, "Transaction finished");

        let opened = info.opened_connection;
        self.transaction = None;
        if opened {
            self.connection = None;
        }
        Ok(())
    }

    /// 释放全部资源；未结束的环境事务被回滚
    pub(crate) async fn reset(&mut self) -> AppResult<()> {
        if self.transaction.is_some() {
            let result = self.rollback().await;
            if let Err(e) = &result {
                warn!(error = %e, "Rollback on close failed, discarding connection");
                self.transaction = None;
                self.discard_connection();
                return result;
            }
        }
        self.close()
    }

    /// 连接状态不可信时直接断开，不归还连接池
    fn discard_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            drop(conn.detach());
        }
        self.pending_undo = None;
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if self.connection.is_some() && (self.transaction.is_some() || self.pending_undo.is_some()) {
            warn!("Context dropped with an unfinished transaction, discarding connection");
            self.discard_connection();
        }
    }
}

async fn flush_pending_undo(conn: &mut PoolConnection<Sqlite>, pending: &mut Option<PendingUndo>) {
    let statements = match pending.take() {
        None => return,
        Some(PendingUndo::Transaction) => vec![ROLLBACK_SQL.to_string()],
        Some(PendingUndo::Savepoint) => vec![
            Savepoint::SCOPE.rollback_sql(),
            Savepoint::SCOPE.release_sql(),
        ],
    };
    for sql in statements {
        if let Err(e) = sqlx::query(&sql).execute(&mut **conn).await {
            debug!(error = %e, statement = %sql, "Deferred undo found nothing to undo");
        }
    }
}

/// 批量操作的连接与事务作用域
///
/// 自建事务时 `complete` 提交、`abort` 回滚。借用环境事务时在 savepoint 内执行：
/// `complete` 释放 savepoint，`abort` 回滚到 savepoint，环境事务本身不提交也不结束。
/// 未结束即被丢弃时：自有连接直接断开（SQLite 随之回滚），
/// 借用连接上的自有事务或 savepoint 在下次使用前撤销。
pub struct TransactionScope<'a> {
    connection: Option<Lease<'a, PoolConnection<Sqlite>>>,
    pending_undo: Option<&'a mut Option<PendingUndo>>,
    transaction: Option<Ownership>,
    finished: bool,
}

impl<'a> TransactionScope<'a> {
    pub(crate) async fn begin(
        slot: &'a mut ConnectionSlot,
        pool: &SqlitePool,
        behavior: TransactionBehavior,
    ) -> AppResult<Self> {
        let ConnectionSlot {
            connection,
            transaction,
            pending_undo,
        } = slot;
        let ambient = transaction.is_some();

        let (lease, flag) = match connection.as_mut() {
            Some(conn) => {
                flush_pending_undo(conn, pending_undo).await;
                (Lease::Borrowed(conn), Some(pending_undo))
            }
            None => {
                if ambient {
                    debug_assert!(false, "ambient transaction without a connection");
                    return Err(AppError::invalid_operation(
                        "ambient transaction has no open connection",
                    ));
                }
                (Lease::Owned(pool.acquire().await?), None)
            }
        };

        let mut scope = Self {
            connection: Some(lease),
            pending_undo: flag,
            transaction: None,
            finished: false,
        };

        // 先标记所有权：BEGIN / SAVEPOINT 中途失败或被丢弃时由 Drop 收尾
        if ambient {
            scope.transaction = Some(Ownership::Borrowed);
            let savepoint = Savepoint::SCOPE;
            sqlx::query(&savepoint.create_sql())
                .execute(scope.connection()?)
                .await?;
            debug!(savepoint = savepoint.name(), "Savepoint created");
        } else {
            scope.transaction = Some(Ownership::Owned);
            sqlx::query(behavior.begin_sql())
                .execute(scope.connection()?)
                .await?;
        }

        debug!(
            connection = ?scope.connection_ownership(),
            transaction = ?scope.transaction,
            "Transaction scope acquired"
        );
        Ok(scope)
    }

    pub fn connection(&mut self) -> AppResult<&mut SqliteConnection> {
        self.connection
            .as_deref_mut()
            .map(|conn| &mut **conn)
            .ok_or_else(|| AppError::internal("transaction scope already released"))
    }

    pub fn connection_ownership(&self) -> Option<Ownership> {
        self.connection.as_ref().map(Lease::ownership)
    }

    pub fn transaction_ownership(&self) -> Option<Ownership> {
        self.transaction
    }

    /// 成功结束：提交自建事务或释放 savepoint，仅归还自有连接
    pub async fn complete(mut self) -> AppResult<()> {
        match self.transaction {
            Some(Ownership::Owned) => {
                sqlx::query(COMMIT_SQL).execute(self.connection()?).await?;
            }
            Some(Ownership::Borrowed) => {
                let savepoint = Savepoint::SCOPE;
                sqlx::query(&savepoint.release_sql())
                    .execute(self.connection()?)
                    .await?;
                debug!(savepoint = savepoint.name(), "Savepoint released");
            }
            None => {}
        }
        self.finished = true;
        if let Some(lease) = self.connection.take() {
            drop(lease.release());
        }
        Ok(())
    }

    /// 失败结束：回滚自建事务，或回滚到 savepoint 后释放；环境事务保持打开
    pub async fn abort(mut self) -> AppResult<()> {
        match self.transaction {
            Some(Ownership::Owned) => {
                sqlx::query(ROLLBACK_SQL).execute(self.connection()?).await?;
            }
            Some(Ownership::Borrowed) => {
                let savepoint = Savepoint::SCOPE;
                sqlx::query(&savepoint.rollback_sql())
                    .execute(self.connection()?)
                    .await?;
                sqlx::query(&savepoint.release_sql())
                    .execute(self.connection()?)
                    .await?;
                debug!(savepoint = savepoint.name(), "Rolled back to savepoint");
            }
            None => {}
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let undo = match (self.transaction, self.connection.take()) {
            (Some(Ownership::Owned), Some(Lease::Owned(conn))) => {
                warn!("Transaction scope dropped before completion, discarding owned connection");
                drop(conn.detach());
                return;
            }
            (Some(Ownership::Owned), Some(Lease::Borrowed(_))) => PendingUndo::Transaction,
            (Some(Ownership::Borrowed), Some(Lease::Borrowed(_))) => PendingUndo::Savepoint,
            _ => return,
        };
        warn!(undo = ?undo, "Transaction scope dropped before completion, undo deferred");
        if let Some(pending) = self.pending_undo.as_deref_mut() {
            *pending = Some(undo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_lease_is_released_to_caller() {
        let lease: Lease<'_, Vec<u8>> = Lease::Owned(vec![1, 2]);

        assert!(lease.is_owned());
        assert_eq!(lease.release(), Some(vec![1, 2]));
    }

    #[test]
    fn test_borrowed_lease_leaves_resource_with_owner() {
        let mut resource = vec![1];
        {
            let mut lease = Lease::Borrowed(&mut resource);
            lease.push(2);
            assert_eq!(lease.ownership(), Ownership::Borrowed);
            assert_eq!(lease.release(), None);
        }

        assert_eq!(resource, vec![1, 2]);
    }

    async fn memory_pool() -> SqlitePool {
        let pool = crate::create_pool(
            &crate::SqliteConfig::new("sqlite::memory:").with_max_connections(1),
        )
        .await
        .unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn insert_item(scope: &mut TransactionScope<'_>, id: i64) -> AppResult<()> {
        sqlx::query("INSERT INTO items (id) VALUES (?)")
            .bind(id)
            .execute(scope.connection()?)
            .await?;
        Ok(())
    }

    async fn count_items(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_aborted_scope_keeps_earlier_ambient_work() {
        let pool = memory_pool().await;
        let mut slot = ConnectionSlot::default();
        slot.begin(&pool, TransactionBehavior::Immediate, chrono::Utc::now())
            .await
            .unwrap();

        let mut scope = TransactionScope::begin(&mut slot, &pool, TransactionBehavior::Immediate)
            .await
            .unwrap();
        insert_item(&mut scope, 1).await.unwrap();
        scope.complete().await.unwrap();

        let mut scope = TransactionScope::begin(&mut slot, &pool, TransactionBehavior::Immediate)
            .await
            .unwrap();
        assert_eq!(scope.transaction_ownership(), Some(Ownership::Borrowed));
        insert_item(&mut scope, 2).await.unwrap();
        assert!(insert_item(&mut scope, 2).await.is_err());
        scope.abort().await.unwrap();

        assert!(slot.in_transaction());
        slot.commit().await.unwrap();
        assert_eq!(count_items(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_dropped_scope_is_undone_before_ambient_commit() {
        let pool = memory_pool().await;
        let mut slot = ConnectionSlot::default();
        slot.begin(&pool, TransactionBehavior::Immediate, chrono::Utc::now())
            .await
            .unwrap();

        {
            let mut scope =
                TransactionScope::begin(&mut slot, &pool, TransactionBehavior::Immediate)
                    .await
                    .unwrap();
            insert_item(&mut scope, 7).await.unwrap();
        }
        assert_eq!(slot.pending_undo, Some(PendingUndo::Savepoint));

        slot.commit().await.unwrap();
        assert_eq!(slot.pending_undo, None);
        assert_eq!(count_items(&pool).await, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "active transaction")]
    fn test_closing_connection_under_transaction_panics_in_debug() {
        let mut slot = ConnectionSlot::default();
        slot.transaction = Some(TransactionInfo::new(
            TransactionBehavior::Deferred,
            chrono::Utc::now(),
            false,
        ));

        let _ = slot.close();
    }
}

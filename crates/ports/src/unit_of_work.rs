//! Unit of Work trait 定义

use async_trait::async_trait;
use strata_errors::AppResult;

/// 一次提交的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub audit_records: usize,
}

impl CommitSummary {
    /// 写入的业务行数
    pub fn entries(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.entries() == 0
    }
}

/// Unit of Work trait
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// 开始显式事务
    async fn begin(&self) -> AppResult<()>;

    /// 原子地提交全部暂存变更及其审计记录
    async fn commit(&self) -> AppResult<CommitSummary>;

    /// 丢弃暂存变更，并回滚显式事务
    async fn rollback(&self) -> AppResult<()>;

    /// 是否存在未提交的变更
    async fn has_changes(&self) -> AppResult<bool>;

    /// 释放上下文及其持有的连接
    async fn close(&self) -> AppResult<()>;
}

//! SQLite 事务模式与事务上下文

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 事务加锁方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionBehavior {
    /// 首次读写时才加锁（SQLite 默认）
    #[default]
    Deferred,
    /// 立即获取写锁
    Immediate,
    /// 独占
    Exclusive,
}

impl TransactionBehavior {
    /// 转换为 BEGIN 语句
    pub fn begin_sql(&self) -> &'static str {
        match self {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

pub(crate) const COMMIT_SQL: &str = "COMMIT";
pub(crate) const ROLLBACK_SQL: &str = "ROLLBACK";

/// 环境事务内的 savepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Savepoint {
    name: &'static str,
}

impl Savepoint {
    /// 批量作用域借用环境事务时使用；上下文加锁保证同一时刻至多一个
    pub(crate) const SCOPE: Savepoint = Savepoint {
        name: "strata_scope",
    };

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn create_sql(&self) -> String {
        format!("SAVEPOINT {}", self.name)
    }

    pub(crate) fn release_sql(&self) -> String {
        format!("RELEASE SAVEPOINT {}", self.name)
    }

    /// ROLLBACK TO 之后 savepoint 仍在栈上，需再 RELEASE
    pub(crate) fn rollback_sql(&self) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.name)
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// 显式（环境）事务的信息
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub behavior: TransactionBehavior,
    /// 事务开始时是否顺带打开了连接，结束时据此关闭
    pub opened_connection: bool,
}

impl TransactionInfo {
    pub(crate) fn new(
        behavior: TransactionBehavior,
        started_at: DateTime<Utc>,
        opened_connection: bool,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            started_at,
            behavior,
            opened_connection,
        }
    }
}

//! strata-adapter-sqlite - SQLite 数据访问适配器
//!
//! 变更跟踪、审计拦截、仓储 / 工作单元以及批量连接协调，基于 sqlx。

mod audit_log;
mod bulk;
mod connection;
mod context;
mod interceptor;
mod repository;
mod sql;
mod store;
mod tracker;
mod transaction;
mod unit_of_work;

#[cfg(test)]
mod test_support;

use sqlx::FromRow;
use sqlx::sqlite::SqliteRow;
use strata_domain_core::Entity;

pub use audit_log::*;
pub use bulk::{Lease, Ownership, TransactionScope};
pub use connection::*;
pub use context::*;
pub use interceptor::*;
pub use repository::*;
pub use store::*;
pub use tracker::{ChangeTracker, EntryState, PendingMutation, PropertyValue};
pub use transaction::*;
pub use unit_of_work::*;

/// 可由 SQLite 行构造的实体
pub trait SqliteEntity: Entity + for<'r> FromRow<'r, SqliteRow> + Unpin {}

impl<E> SqliteEntity for E where E: Entity + for<'r> FromRow<'r, SqliteRow> + Unpin {}

//! Repository trait 定义

use async_trait::async_trait;
use strata_common::Page;
use strata_domain_core::{Entity, Tracked};
use strata_errors::AppResult;

use crate::Navigation;

/// 基础 Repository trait
///
/// 写操作只暂存变更，提交由所属工作单元负责（`Store` 除外）
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// 根据主键查找，未找到返回 `None`
    async fn get(&self, key: &E::Key, navigation: Option<&Navigation>) -> AppResult<Option<E>>;

    /// 查询全部（物化结果）
    async fn get_all(&self, navigation: Option<&Navigation>) -> AppResult<Vec<E>>;

    /// 暂存插入；数据库生成的主键在提交后经由返回的句柄可见
    async fn add(&self, entity: E) -> AppResult<Tracked<E>>;

    /// 暂存更新
    async fn update(&self, entity: E) -> AppResult<Tracked<E>>;

    /// 暂存删除
    async fn remove(&self, entity: &E) -> AppResult<()>;
}

/// 扩展 Repository：批量、存在性、计数、upsert 与分页
#[async_trait]
pub trait ExtendedRepository<E: Entity>: Repository<E> {
    async fn add_many(&self, entities: Vec<E>) -> AppResult<Vec<Tracked<E>>>;

    async fn update_many(&self, entities: Vec<E>) -> AppResult<Vec<Tracked<E>>>;

    async fn remove_many(&self, entities: &[E]) -> AppResult<()>;

    /// 按主键删除，返回是否找到
    async fn remove_by_key(&self, key: &E::Key) -> AppResult<bool>;

    /// 主键是否存在（含当前工作单元中尚未提交的插入）
    async fn exists(&self, key: &E::Key) -> AppResult<bool>;

    /// 塑形查询是否至少返回一行
    async fn exists_where(&self, navigation: &Navigation) -> AppResult<bool>;

    async fn count(&self, navigation: Option<&Navigation>) -> AppResult<i64>;

    /// 先检查后写入，对并发写入者不是原子的
    async fn add_or_update(&self, entity: E) -> AppResult<Tracked<E>>;

    /// 不存在时插入，返回 `None` 表示已存在
    async fn add_if_not_exists(&self, entity: E) -> AppResult<Option<Tracked<E>>>;

    /// 存在时更新，返回 `None` 表示不存在
    async fn update_if_exists(&self, entity: E) -> AppResult<Option<Tracked<E>>>;

    /// 分页查询，页码从 1 开始
    async fn get_page(
        &self,
        page_number: u64,
        page_size: u64,
        navigation: Option<&Navigation>,
    ) -> AppResult<Page<E>>;
}

/// 集合式批量操作
///
/// 绕过变更跟踪与审计，直接在连接上执行
#[async_trait]
pub trait BulkRepository<E: Entity>: Send + Sync {
    async fn bulk_insert(&self, entities: Vec<E>) -> AppResult<u64>;

    async fn bulk_update(&self, entities: Vec<E>) -> AppResult<u64>;

    async fn bulk_delete(&self, keys: &[E::Key]) -> AppResult<u64>;

    async fn bulk_delete_where(&self, navigation: &Navigation) -> AppResult<u64>;
}

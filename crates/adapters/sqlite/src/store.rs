//! 自动提交的仓储
//!
//! 每次写操作暂存后立即提交所属上下文。暂存或提交失败时，跟踪器回到本次调用之前的状态：
//! 本次暂存的变更被撤销，同一上下文中其他仓储暂存的变更保持不动。

use std::future::Future;

use async_trait::async_trait;
use strata_common::Page;
use strata_domain_core::{EntityDescriptor, Tracked};
use strata_errors::AppResult;
use strata_ports::{BulkRepository, ExtendedRepository, Navigation, Repository};
use tracing::warn;

use crate::SqliteEntity;
use crate::context::DbContext;
use crate::repository::SqlRepository;

/// 自动提交的仓储
#[derive(Debug)]
pub struct Store<E: SqliteEntity> {
    repository: SqlRepository<E>,
}

impl<E: SqliteEntity> Clone for Store<E> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
        }
    }
}

impl<E: SqliteEntity> Store<E> {
    pub fn new(context: &DbContext) -> AppResult<Self> {
        Ok(Self {
            repository: SqlRepository::new(context)?,
        })
    }

    pub fn descriptor(&self) -> &EntityDescriptor<E> {
        self.repository.descriptor()
    }

    async fn committed<T: Send>(
        &self,
        stage: impl Future<Output = AppResult<T>> + Send,
    ) -> AppResult<T> {
        let context = self.repository.context()?;
        let checkpoint = context.tracker_checkpoint().await?;

        let result = match stage.await {
            Ok(value) => context.save_changes().await.map(|_| value),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(restore) = context.restore_tracker(checkpoint).await {
                warn!(error = %restore, "Restoring tracked changes after failed write failed");
            }
        }
        result
    }
}

#[async_trait]
impl<E: SqliteEntity> Repository<E> for Store<E> {
    async fn get(&self, key: &E::Key, navigation: Option<&Navigation>) -> AppResult<Option<E>> {
        self.repository.get(key, navigation).await
    }

    async fn get_all(&self, navigation: Option<&Navigation>) -> AppResult<Vec<E>> {
        self.repository.get_all(navigation).await
    }

    async fn add(&self, entity: E) -> AppResult<Tracked<E>> {
        self.committed(self.repository.add(entity)).await
    }

    async fn update(&self, entity: E) -> AppResult<Tracked<E>> {
        self.committed(self.repository.update(entity)).await
    }

    async fn remove(&self, entity: &E) -> AppResult<()> {
        self.committed(self.repository.remove(entity)).await
    }
}

#[async_trait]
impl<E: SqliteEntity> ExtendedRepository<E> for Store<E> {
    async fn add_many(&self, entities: Vec<E>) -> AppResult<Vec<Tracked<E>>> {
        self.committed(self.repository.add_many(entities)).await
    }

    async fn update_many(&self, entities: Vec<E>) -> AppResult<Vec<Tracked<E>>> {
        self.committed(self.repository.update_many(entities)).await
    }

    async fn remove_many(&self, entities: &[E]) -> AppResult<()> {
        self.committed(self.repository.remove_many(entities)).await
    }

    async fn remove_by_key(&self, key: &E::Key) -> AppResult<bool> {
        self.committed(self.repository.remove_by_key(key)).await
    }

    async fn exists(&self, key: &E::Key) -> AppResult<bool> {
        self.repository.exists(key).await
    }

    async fn exists_where(&self, navigation: &Navigation) -> AppResult<bool> {
        self.repository.exists_where(navigation).await
    }

    async fn count(&self, navigation: Option<&Navigation>) -> AppResult<i64> {
        self.repository.count(navigation).await
    }

    async fn add_or_update(&self, entity: E) -> AppResult<Tracked<E>> {
        self.committed(self.repository.add_or_update(entity)).await
    }

    async fn add_if_not_exists(&self, entity: E) -> AppResult<Option<Tracked<E>>> {
        self.committed(self.repository.add_if_not_exists(entity)).await
    }

    async fn update_if_exists(&self, entity: E) -> AppResult<Option<Tracked<E>>> {
        self.committed(self.repository.update_if_exists(entity)).await
    }

    async fn get_page(
        &self,
        page_number: u64,
        page_size: u64,
        navigation: Option<&Navigation>,
    ) -> AppResult<Page<E>> {
        self.repository
            .get_page(page_number, page_size, navigation)
            .await
    }
}

#[async_trait]
impl<E: SqliteEntity> BulkRepository<E> for Store<E> {
    async fn bulk_insert(&self, entities: Vec<E>) -> AppResult<u64> {
        self.repository.bulk_insert(entities).await
    }

    async fn bulk_update(&self, entities: Vec<E>) -> AppResult<u64> {
        self.repository.bulk_update(entities).await
    }

    async fn bulk_delete(&self, keys: &[E::Key]) -> AppResult<u64> {
        self.repository.bulk_delete(keys).await
    }

    async fn bulk_delete_where(&self, navigation: &Navigation) -> AppResult<u64> {
        self.repository.bulk_delete_where(navigation).await
    }
}

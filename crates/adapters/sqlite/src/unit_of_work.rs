//! SQLite Unit of Work 实现

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use strata_common::{Clock, SystemClock};
use strata_config::{AppConfig, AuditConfig};
use strata_domain_core::{JsonSnapshotSerializer, ModelRegistry, SnapshotSerializer};
use strata_errors::{AppError, AppResult};
use strata_ports::{CommitSummary, UnitOfWork};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::SqliteEntity;
use crate::audit_log::ensure_audit_table;
use crate::connection::{SqliteConfig, create_pool};
use crate::context::DbContext;
use crate::repository::SqlRepository;
use crate::store::Store;
use crate::transaction::TransactionBehavior;

type Cache = Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

/// 工作单元：独占一个上下文，按实体类型惰性创建并缓存仓储
pub struct SqliteUnitOfWork {
    context: DbContext,
    repositories: Cache,
    stores: Cache,
}

impl SqliteUnitOfWork {
    pub fn new(context: DbContext) -> Self {
        Self {
            context,
            repositories: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &DbContext {
        &self.context
    }

    /// 实体类型对应的仓储，首次访问时创建
    pub fn repository<E: SqliteEntity>(&self) -> AppResult<Arc<SqlRepository<E>>> {
        cached(&self.repositories, || SqlRepository::new(&self.context))
    }

    /// 实体类型对应的自动提交仓储，首次访问时创建
    pub fn store<E: SqliteEntity>(&self) -> AppResult<Arc<Store<E>>> {
        cached(&self.stores, || Store::new(&self.context))
    }
}

fn cached<T: Send + Sync + 'static>(
    cache: &Cache,
    create: impl FnOnce() -> AppResult<T>,
) -> AppResult<Arc<T>> {
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = cache.get(&TypeId::of::<T>()) {
        return Arc::clone(existing)
            .downcast::<T>()
            .map_err(|_| AppError::internal("repository cache type mismatch"));
    }

    let created = Arc::new(create()?);
    cache.insert(TypeId::of::<T>(), created.clone());
    Ok(created)
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    async fn begin(&self) -> AppResult<()> {
        self.context
            .begin_transaction(TransactionBehavior::Immediate)
            .await?;
        Ok(())
    }

    /// 显式事务中先保存再提交事务；保存失败时事务保持打开，由调用方回滚
    async fn commit(&self) -> AppResult<CommitSummary> {
        let summary = self.context.save_changes().await?;
        if self.context.in_transaction().await? {
            self.context.commit_transaction().await?;
        }
        Ok(summary)
    }

    async fn rollback(&self) -> AppResult<()> {
        if self.context.in_transaction().await? {
            self.context.rollback_transaction().await
        } else {
            self.context.discard_changes().await
        }
    }

    async fn has_changes(&self) -> AppResult<bool> {
        self.context.has_changes().await
    }

    async fn close(&self) -> AppResult<()> {
        self.context.close().await
    }
}

impl std::fmt::Debug for SqliteUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteUnitOfWork")
            .field("context", &self.context)
            .finish()
    }
}

/// 工作单元工厂
///
/// 持有连接池与注册表，每次 `create` 得到一个独立上下文
#[derive(Clone)]
pub struct SqliteUnitOfWorkFactory {
    pool: SqlitePool,
    registry: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn SnapshotSerializer>,
    audit: AuditConfig,
    cancel: Option<CancellationToken>,
}

impl SqliteUnitOfWorkFactory {
    pub fn new(pool: SqlitePool, registry: Arc<ModelRegistry>) -> Self {
        Self {
            pool,
            registry,
            clock: Arc::new(SystemClock),
            serializer: Arc::new(JsonSnapshotSerializer),
            audit: AuditConfig::default(),
            cancel: None,
        }
    }

    /// 按应用配置创建连接池，并确保审计表存在
    pub async fn connect(config: &AppConfig, registry: Arc<ModelRegistry>) -> AppResult<Self> {
        config.validate()?;
        let pool = create_pool(&SqliteConfig::from_database_config(&config.database)).await?;
        if config.audit.enabled {
            ensure_audit_table(&pool, &config.audit.table_name).await?;
        }
        info!(
            tables = registry.len(),
            audit_table = %config.audit.table_name,
            "Unit of work factory ready"
        );
        Ok(Self::new(pool, registry).with_audit_config(config.audit.clone()))
    }

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

    /// 工厂创建的每个上下文使用该令牌的子令牌
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// 独立上下文（供单独使用的 `Store`）
    pub fn context(&self) -> AppResult<DbContext> {
        let cancel = self
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        DbContext::builder(self.pool.clone(), Arc::clone(&self.registry))
            .with_clock(Arc::clone(&self.clock))
            .with_serializer(Arc::clone(&self.serializer))
            .with_audit_config(self.audit.clone())
            .with_cancellation(cancel)
            .build()
    }

    pub fn create(&self) -> AppResult<SqliteUnitOfWork> {
        let unit = SqliteUnitOfWork::new(self.context()?);
        debug!("Unit of work created");
        Ok(unit)
    }
}

impl std::fmt::Debug for SqliteUnitOfWorkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteUnitOfWorkFactory")
            .field("registry", &self.registry)
            .field("audit", &self.audit)
            .finish()
    }
}

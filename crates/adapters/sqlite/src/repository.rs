//! 通用 SQL 仓储
//!
//! 写操作只在上下文的变更跟踪器中暂存，由 `save_changes` 统一提交；
//! 批量操作经由批量连接协调器直接在连接上执行。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqliteConnection;
use strata_common::{Page, PageRequest};
use strata_domain_core::{
    EntityDescriptor, EntityKey, FieldMap, FieldRole, KeyGeneration, Tracked,
};
use strata_errors::{AppError, AppResult};
use strata_ports::{
    BulkRepository, Condition, ExtendedRepository, Navigation, Repository, Selection, shape,
};
use strata_telemetry::{record_bulk_operation, record_db_operation};
use tracing::{debug, warn};

use crate::SqliteEntity;
use crate::bulk::TransactionScope;
use crate::context::{ContextRef, ContextState, DbContext};
use crate::sql::{self, Builder};
use crate::tracker::EntryState;
use crate::transaction::TransactionBehavior;

/// 单条 `IN (...)` 的主键数上限
const KEYS_PER_STATEMENT: usize = 500;

/// 通用 SQL 仓储
pub struct SqlRepository<E: SqliteEntity> {
    context: ContextRef,
    descriptor: Arc<EntityDescriptor<E>>,
}

impl<E: SqliteEntity> Clone for SqlRepository<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            descriptor: Arc::clone(&self.descriptor),
        }
    }
}

impl<E: SqliteEntity> std::fmt::Debug for SqlRepository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlRepository")
            .field("table", &self.descriptor.table())
            .field("context", &self.context)
            .finish()
    }
}

impl<E: SqliteEntity> SqlRepository<E> {
    /// 绑定到上下文；实体未注册时返回配置错误
    pub fn new(context: &DbContext) -> AppResult<Self> {
        Ok(Self {
            context: context.downgrade(),
            descriptor: context.descriptor::<E>()?,
        })
    }

    pub fn descriptor(&self) -> &EntityDescriptor<E> {
        &self.descriptor
    }

    pub(crate) fn context(&self) -> AppResult<DbContext> {
        self.context.upgrade()
    }

    fn key_value(&self, key: &E::Key) -> AppResult<Value> {
        self.descriptor.key_value(key)
    }

    fn key_selection(&self, key: &E::Key) -> AppResult<Selection> {
        Ok(Selection::new().filter(Condition::eq(
            self.descriptor.key_column(),
            self.key_value(key)?,
        )))
    }

    fn ensure_key(&self, key: &E::Key) -> AppResult<()> {
        if key.is_default() {
            return Err(AppError::invalid_argument(format!(
                "a key is required for `{}`",
                self.descriptor.table()
            )));
        }
        Ok(())
    }

    /// 默认排序：按主键升序
    fn ordered(&self, selection: Selection) -> Selection {
        if selection.ordering().is_empty() {
            selection.order_asc(self.descriptor.key_column())
        } else {
            selection
        }
    }

    /// 执行塑形查询；开启跟踪时结果附加到跟踪器并做标识解析
    async fn fetch(&self, selection: Selection) -> AppResult<Vec<E>> {
        sql::validate_selection(&self.descriptor, &selection)?;
        let context = self.context()?;
        let table = self.descriptor.table();

        let started = Instant::now();
        let mut state = context.lock().await?;
        let ContextState { slot, tracker } = &mut *state;
        let result = context
            .guard("query", async {
                let mut lease = slot.lease(context.pool()).await?;
                let mut qb = sql::select(table, &selection)?;
                let rows = qb.build_query_as::<E>().fetch_all(&mut **lease).await?;
                Ok(rows)
            })
            .await;
        record_db_operation(
            "select",
            table,
            started.elapsed().as_secs_f64() * 1000.0,
            result.is_ok(),
        );
        let rows = result?;

        if !selection.is_tracking() {
            return Ok(rows);
        }
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(entity) = tracker.attach(&self.descriptor, row)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// 执行标量查询（计数 / 存在性）
    async fn scalar(&self, operation: &'static str, mut qb: Builder) -> AppResult<i64> {
        let context = self.context()?;
        let table = self.descriptor.table();

        let started = Instant::now();
        let mut state = context.lock().await?;
        let slot = &mut state.slot;
        let result = context
            .guard(operation, async {
                let mut lease = slot.lease(context.pool()).await?;
                let value: i64 = qb.build_query_scalar().fetch_one(&mut **lease).await?;
                Ok(value)
            })
            .await;
        record_db_operation(
            operation,
            table,
            started.elapsed().as_secs_f64() * 1000.0,
            result.is_ok(),
        );
        result
    }

    /// 本地跟踪器中的状态
    async fn local(&self, key: &E::Key) -> AppResult<Option<(EntryState, Tracked<E>)>> {
        let context = self.context()?;
        let state = context.lock().await?;
        state.tracker.lookup(&self.descriptor, key)
    }

    async fn stage<T>(
        &self,
        stage: impl FnOnce(&mut ContextState, &Arc<EntityDescriptor<E>>) -> AppResult<T> + Send,
    ) -> AppResult<T> {
        let context = self.context()?;
        let mut state = context.lock().await?;
        stage(&mut *state, &self.descriptor)
    }

    /// 批量语句在同一作用域中执行：借用环境事务，或自建事务并在结束时提交
    async fn execute_bulk(&self, operation: &'static str, statements: Vec<Builder>) -> AppResult<u64> {
        let context = self.context()?;
        context.ensure_active(operation)?;
        let table = self.descriptor.table();

        let started = Instant::now();
        let mut state = context.lock().await?;
        let mut scope =
            TransactionScope::begin(&mut state.slot, context.pool(), TransactionBehavior::Immediate)
                .await?;

        let result = context
            .guard(operation, execute_all(&mut scope, statements))
            .await;
        let result = match result {
            Ok(rows) => scope.complete().await.map(|_| rows),
            Err(e) => {
                if let Err(rollback) = scope.abort().await {
                    warn!(error = %rollback, operation, table, "Bulk rollback failed");
                }
                Err(e)
            }
        };

        record_db_operation(
            operation,
            table,
            started.elapsed().as_secs_f64() * 1000.0,
            result.is_ok(),
        );
        if let Ok(rows) = &result {
            record_bulk_operation(operation, table, *rows);
            debug!(operation, table, rows, "Bulk operation finished");
        }
        result
    }

    /// 批量写入的列：跳过待生成的主键与 `skip` 角色的时间戳列
    fn bulk_columns<'a>(
        &self,
        snapshot: &'a FieldMap,
        include_key: bool,
        skip: FieldRole,
    ) -> Vec<(&'a str, &'a Value)> {
        self.descriptor
            .fields()
            .iter()
            .filter(|f| f.role() != skip)
            .filter(|f| include_key || f.role() != FieldRole::Key)
            .filter_map(|f| snapshot.get_key_value(f.name()))
            .map(|(name, value)| (name.as_str(), value))
            .collect()
    }
}

async fn execute_all(
    scope: &mut TransactionScope<'_>,
    mut statements: Vec<Builder>,
) -> AppResult<u64> {
    let mut rows = 0;
    for qb in statements.iter_mut() {
        let conn: &mut SqliteConnection = scope.connection()?;
        rows += qb.build().execute(conn).await?.rows_affected();
    }
    Ok(rows)
}

#[async_trait]
impl<E: SqliteEntity> Repository<E> for SqlRepository<E> {
    async fn get(&self, key: &E::Key, navigation: Option<&Navigation>) -> AppResult<Option<E>> {
        self.ensure_key(key)?;
        if navigation.is_none() {
            match self.local(key).await? {
                Some((EntryState::Deleted, _)) => return Ok(None),
                Some((_, tracked)) => return Ok(Some(tracked.snapshot())),
                None => {}
            }
        }

        let selection = shape(navigation)
            .filter(Condition::eq(self.descriptor.key_column(), self.key_value(key)?))
            .limit(1);
        Ok(self.fetch(selection).await?.into_iter().next())
    }

    async fn get_all(&self, navigation: Option<&Navigation>) -> AppResult<Vec<E>> {
        self.fetch(shape(navigation)).await
    }

    async fn add(&self, entity: E) -> AppResult<Tracked<E>> {
        self.stage(|state, descriptor| state.tracker.add(descriptor, entity))
            .await
    }

    async fn update(&self, entity: E) -> AppResult<Tracked<E>> {
        self.stage(|state, descriptor| state.tracker.update(descriptor, entity))
            .await
    }

    async fn remove(&self, entity: &E) -> AppResult<()> {
        self.stage(|state, descriptor| state.tracker.remove(descriptor, entity))
            .await
    }
}

#[async_trait]
impl<E: SqliteEntity> ExtendedRepository<E> for SqlRepository<E> {
    async fn add_many(&self, entities: Vec<E>) -> AppResult<Vec<Tracked<E>>> {
        self.stage(|state, descriptor| state.tracker.add_many(descriptor, entities))
            .await
    }

    async fn update_many(&self, entities: Vec<E>) -> AppResult<Vec<Tracked<E>>> {
        for entity in &entities {
            self.ensure_key(entity.key())?;
        }
        self.stage(|state, descriptor| {
            entities
                .into_iter()
                .map(|entity| state.tracker.update(descriptor, entity))
                .collect()
        })
        .await
    }

    async fn remove_many(&self, entities: &[E]) -> AppResult<()> {
        for entity in entities {
            self.ensure_key(entity.key())?;
        }
        self.stage(|state, descriptor| {
            entities
                .iter()
                .try_for_each(|entity| state.tracker.remove(descriptor, entity))
        })
        .await
    }

    async fn remove_by_key(&self, key: &E::Key) -> AppResult<bool> {
        match self.get(key, None).await? {
            Some(entity) => {
                self.remove(&entity).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &E::Key) -> AppResult<bool> {
        self.ensure_key(key)?;
        match self.local(key).await? {
            Some((EntryState::Deleted, _)) => return Ok(false),
            Some(_) => return Ok(true),
            None => {}
        }
        let qb = sql::exists(self.descriptor.table(), &self.key_selection(key)?)?;
        Ok(self.scalar("exists", qb).await? != 0)
    }

    async fn exists_where(&self, navigation: &Navigation) -> AppResult<bool> {
        let selection = navigation.apply(Selection::new());
        sql::validate_selection(&self.descriptor, &selection)?;
        let qb = sql::exists(self.descriptor.table(), &selection)?;
        Ok(self.scalar("exists", qb).await? != 0)
    }

    async fn count(&self, navigation: Option<&Navigation>) -> AppResult<i64> {
        let selection = shape(navigation);
        sql::validate_selection(&self.descriptor, &selection)?;
        let qb = sql::count(self.descriptor.table(), &selection)?;
        self.scalar("count", qb).await
    }

    async fn add_or_update(&self, entity: E) -> AppResult<Tracked<E>> {
        if self.generates_key(&entity) || !self.exists(entity.key()).await? {
            self.add(entity).await
        } else {
            self.update(entity).await
        }
    }

    async fn add_if_not_exists(&self, entity: E) -> AppResult<Option<Tracked<E>>> {
        if !self.generates_key(&entity) && self.exists(entity.key()).await? {
            return Ok(None);
        }
        self.add(entity).await.map(Some)
    }

    async fn update_if_exists(&self, entity: E) -> AppResult<Option<Tracked<E>>> {
        if !self.exists(entity.key()).await? {
            return Ok(None);
        }
        self.update(entity).await.map(Some)
    }

    async fn get_page(
        &self,
        page_number: u64,
        page_size: u64,
        navigation: Option<&Navigation>,
    ) -> AppResult<Page<E>> {
        let request = PageRequest::new(page_number, page_size)?;
        let selection = self.ordered(shape(navigation).without_paging());
        sql::validate_selection(&self.descriptor, &selection)?;

        let total = self
            .scalar("count", sql::count(self.descriptor.table(), &selection)?)
            .await?;
        let total = u64::try_from(total).unwrap_or_default();
        if request.offset() >= total {
            return Ok(Page::new(Vec::new(), total, &request));
        }

        let items = self
            .fetch(selection.limit(request.limit()).offset(request.offset()))
            .await?;
        Ok(Page::new(items, total, &request))
    }
}

impl<E: SqliteEntity> SqlRepository<E> {
    /// 主键由数据库生成且尚未赋值
    fn generates_key(&self, entity: &E) -> bool {
        self.descriptor.key_generation() == KeyGeneration::Database && entity.key().is_default()
    }
}

#[async_trait]
impl<E: SqliteEntity> BulkRepository<E> for SqlRepository<E> {
    async fn bulk_insert(&self, mut entities: Vec<E>) -> AppResult<u64> {
        for entity in &entities {
            if !self.generates_key(entity) {
                self.ensure_key(entity.key())?;
            }
        }
        let now = self.context()?.now();

        let mut statements = Vec::with_capacity(entities.len());
        for entity in &mut entities {
            entity.timestamps_mut().stamp_created(now);
            let include_key = !self.generates_key(entity);
            let snapshot = self.descriptor.snapshot(entity)?;
            let columns = self.bulk_columns(&snapshot, include_key, FieldRole::ModifiedAt);
            statements.push(sql::insert(self.descriptor.table(), &columns)?);
        }
        self.execute_bulk("bulk_insert", statements).await
    }

    async fn bulk_update(&self, mut entities: Vec<E>) -> AppResult<u64> {
        for entity in &entities {
            self.ensure_key(entity.key())?;
        }
        let now = self.context()?.now();

        let mut statements = Vec::with_capacity(entities.len());
        for entity in &mut entities {
            entity.timestamps_mut().stamp_modified(now);
            let snapshot = self.descriptor.snapshot(entity)?;
            let columns = self.bulk_columns(&snapshot, false, FieldRole::CreatedAt);
            statements.push(sql::update(
                self.descriptor.table(),
                &columns,
                self.descriptor.key_column(),
                &self.key_value(entity.key())?,
            )?);
        }
        self.execute_bulk("bulk_update", statements).await
    }

    async fn bulk_delete(&self, keys: &[E::Key]) -> AppResult<u64> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            self.ensure_key(key)?;
            values.push(self.key_value(key)?);
        }

        let statements = values
            .chunks(KEYS_PER_STATEMENT)
            .map(|chunk| {
                sql::delete_where(
                    self.descriptor.table(),
                    &[Condition::in_list(
                        self.descriptor.key_column(),
                        chunk.iter().cloned(),
                    )],
                )
            })
            .collect::<AppResult<Vec<_>>>()?;
        self.execute_bulk("bulk_delete", statements).await
    }

    async fn bulk_delete_where(&self, navigation: &Navigation) -> AppResult<u64> {
        let selection = navigation.apply(Selection::new());
        sql::validate_selection(&self.descriptor, &selection)?;
        if selection.limit_value().is_some() || selection.offset_value().is_some() {
            return Err(AppError::invalid_argument(
                "bulk delete does not support limit or offset",
            ));
        }

        let statement = sql::delete_where(self.descriptor.table(), selection.conditions())?;
        self.execute_bulk("bulk_delete_where", vec![statement]).await
    }
}

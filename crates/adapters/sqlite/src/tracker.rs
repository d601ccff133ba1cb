//! 变更跟踪器
//!
//! 记录当前工作单元中的实体条目及其状态，提交前枚举待写入的变更，
//! 并为每个条目生成按字段划分的原值 / 当前值。

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use strata_domain_core::{
    AuditAction, Entity, EntityDescriptor, EntityKey, FieldMap, FieldRole, KeyGeneration, Tracked,
};
use strata_errors::{AppError, AppResult};

/// 条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unchanged,
    Added,
    Modified,
    Deleted,
}

impl EntryState {
    pub fn is_pending(&self) -> bool {
        !matches!(self, EntryState::Unchanged)
    }

    fn action(&self) -> Option<AuditAction> {
        match self {
            EntryState::Unchanged => None,
            EntryState::Added => Some(AuditAction::Added),
            EntryState::Modified => Some(AuditAction::Modified),
            EntryState::Deleted => Some(AuditAction::Deleted),
        }
    }
}

/// 单个字段的原值与当前值
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyValue {
    pub name: &'static str,
    pub original: Option<Value>,
    pub current: Value,
    /// 是否写入数据库
    pub modified: bool,
    /// 值由数据库生成且尚未回填
    pub temporary: bool,
    pub is_key: bool,
}

/// 待写入的变更
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub(crate) entry: usize,
    pub table: &'static str,
    pub key_column: &'static str,
    pub action: AuditAction,
    pub audited: bool,
    pub properties: Vec<PropertyValue>,
}

impl PendingMutation {
    pub fn key(&self) -> Option<&PropertyValue> {
        self.properties.iter().find(|p| p.is_key)
    }

    pub fn has_temporary_values(&self) -> bool {
        self.properties.iter().any(|p| p.temporary)
    }

    /// 回填数据库生成的值
    pub(crate) fn resolve_temporary(&mut self, value: Value) {
        for property in self.properties.iter_mut().filter(|p| p.temporary) {
            property.current = value.clone();
            property.temporary = false;
        }
    }

    /// 写入的列（不含主键）
    pub fn written_columns(&self) -> Vec<(&str, &Value)> {
        self.properties
            .iter()
            .filter(|p| p.modified && !p.is_key)
            .map(|p| (p.name, &p.current))
            .collect()
    }

    /// INSERT 的列：已知主键也一并写入
    pub fn insert_columns(&self) -> Vec<(&str, &Value)> {
        self.properties
            .iter()
            .filter(|p| (p.modified && !p.is_key) || (p.is_key && !p.temporary))
            .map(|p| (p.name, &p.current))
            .collect()
    }

    pub fn keys(&self) -> FieldMap {
        self.properties
            .iter()
            .filter(|p| p.is_key)
            .map(|p| (p.name.to_string(), p.current.clone()))
            .collect()
    }

    pub fn previous_state(&self) -> FieldMap {
        let include = |p: &&PropertyValue| match self.action {
            AuditAction::Added => false,
            AuditAction::Modified => p.modified,
            AuditAction::Deleted => true,
        };
        self.properties
            .iter()
            .filter(|p| !p.is_key)
            .filter(include)
            .filter_map(|p| p.original.clone().map(|v| (p.name.to_string(), v)))
            .collect()
    }

    pub fn new_state(&self) -> FieldMap {
        if self.action == AuditAction::Deleted {
            return FieldMap::new();
        }
        self.properties
            .iter()
            .filter(|p| !p.is_key && p.modified)
            .map(|p| (p.name.to_string(), p.current.clone()))
            .collect()
    }
}

/// 类型擦除后的条目操作
pub(crate) trait TrackedEntry: Send + Sync {
    fn entity_type(&self) -> TypeId;

    fn table(&self) -> &'static str;

    fn state(&self) -> EntryState;

    fn identity(&self) -> Option<&str>;

    /// 写入审计时间戳；重试提交时沿用首次的时间。
    /// 没有实际字段变化的更新条目回到 Unchanged
    fn stamp(&mut self, now: DateTime<Utc>) -> AppResult<()>;

    fn pending_mutation(&self, index: usize) -> AppResult<Option<PendingMutation>>;

    fn resolve_generated_key(&mut self, value: &Value) -> AppResult<()>;

    fn reset_generated_key(&mut self);

    /// 提交成功：刷新原值快照，状态回到 Unchanged
    fn accept(&mut self) -> AppResult<()>;

    /// 保存条目及实体当前值
    fn checkpoint(&self) -> Box<dyn EntryCheckpoint>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// 条目检查点
pub(crate) trait EntryCheckpoint: Send + Sync {
    /// 写回实体值并交回条目
    fn restore(self: Box<Self>) -> Box<dyn TrackedEntry>;
}

struct SavedEntry<E: Entity> {
    entry: EntityEntry<E>,
    value: E,
}

impl<E: Entity> EntryCheckpoint for SavedEntry<E> {
    fn restore(self: Box<Self>) -> Box<dyn TrackedEntry> {
        let SavedEntry { entry, value } = *self;
        entry.entity.write(|e| *e = value);
        Box::new(entry)
    }
}

#[derive(Clone)]
pub(crate) struct EntityEntry<E: Entity> {
    descriptor: Arc<EntityDescriptor<E>>,
    entity: Tracked<E>,
    state: EntryState,
    original: Option<FieldMap>,
    identity: Option<String>,
    /// 未被跟踪时的整体更新：全部字段视为已修改
    full_update: bool,
    stamped_at: Option<DateTime<Utc>>,
    generated_key: bool,
}

impl<E: Entity> EntityEntry<E> {
    fn new(
        descriptor: Arc<EntityDescriptor<E>>,
        entity: Tracked<E>,
        state: EntryState,
        original: Option<FieldMap>,
        identity: Option<String>,
    ) -> Self {
        Self {
            descriptor,
            entity,
            state,
            original,
            identity,
            full_update: false,
            stamped_at: None,
            generated_key: false,
        }
    }

    fn has_column_changes(&self) -> AppResult<bool> {
        if self.full_update {
            return Ok(true);
        }
        let Some(original) = self.original.as_ref() else {
            return Ok(true);
        };
        let current = self.entity.read(|e| self.descriptor.snapshot(e))?;
        Ok(self
            .descriptor
            .fields()
            .iter()
            .filter(|f| f.role() == FieldRole::Column)
            .any(|f| current.get(f.name()) != original.get(f.name())))
    }

    fn property(
        &self,
        name: &'static str,
        role: FieldRole,
        current: Value,
        original: Option<Value>,
    ) -> PropertyValue {
        let is_key = role == FieldRole::Key;
        let temporary = is_key
            && self.state == EntryState::Added
            && self.descriptor.key_generation() == KeyGeneration::Database
            && self.entity.read(|e| e.key().is_default());

        let modified = match (self.state, role) {
            (_, FieldRole::Key) => false,
            (EntryState::Added, FieldRole::ModifiedAt) => false,
            (EntryState::Added, _) => true,
            (EntryState::Modified, FieldRole::CreatedAt) => false,
            (EntryState::Modified, FieldRole::ModifiedAt) => true,
            (EntryState::Modified, FieldRole::Column) => {
                self.full_update || original.as_ref() != Some(&current)
            }
            _ => false,
        };

        PropertyValue {
            name,
            original,
            current,
            modified,
            temporary,
            is_key,
        }
    }
}

impl<E: Entity> TrackedEntry for EntityEntry<E> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn table(&self) -> &'static str {
        self.descriptor.table()
    }

    fn state(&self) -> EntryState {
        self.state
    }

    fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn stamp(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if self.state == EntryState::Modified && !self.has_column_changes()? {
            self.state = EntryState::Unchanged;
            return Ok(());
        }

        let at = *self.stamped_at.get_or_insert(now);
        let original_created = self
            .original
            .as_ref()
            .and_then(|o| self.descriptor.column_for(FieldRole::CreatedAt).and_then(|c| o.get(c)))
            .and_then(|v| serde_json::from_value::<Option<DateTime<Utc>>>(v.clone()).ok())
            .flatten();

        match self.state {
            EntryState::Added => self.entity.write(|e| e.timestamps_mut().stamp_created(at)),
            EntryState::Modified => self.entity.write(|e| {
                let stamps = e.timestamps_mut();
                stamps.stamp_modified(at);
                if original_created.is_some() {
                    stamps.created_at = original_created;
                }
            }),
            EntryState::Unchanged | EntryState::Deleted => {}
        }
        Ok(())
    }

    fn pending_mutation(&self, index: usize) -> AppResult<Option<PendingMutation>> {
        let Some(action) = self.state.action() else {
            return Ok(None);
        };

        let current = self.entity.read(|e| self.descriptor.snapshot(e))?;
        let original = match self.state {
            EntryState::Deleted => Some(self.original.clone().unwrap_or_else(|| current.clone())),
            _ => self.original.clone(),
        };

        let properties: Vec<PropertyValue> = self
            .descriptor
            .fields()
            .iter()
            .map(|field| {
                let value = current.get(field.name()).cloned().unwrap_or(Value::Null);
                let before = original
                    .as_ref()
                    .map(|o| o.get(field.name()).cloned().unwrap_or(Value::Null));
                self.property(field.name(), field.role(), value, before)
            })
            .collect();

        if self.state == EntryState::Modified
            && !properties
                .iter()
                .any(|p| p.modified && !p.is_key && !is_timestamp(&self.descriptor, p.name))
        {
            return Ok(None);
        }

        Ok(Some(PendingMutation {
            entry: index,
            table: self.descriptor.table(),
            key_column: self.descriptor.key_column(),
            action,
            audited: self.descriptor.is_audited(),
            properties,
        }))
    }

    fn resolve_generated_key(&mut self, value: &Value) -> AppResult<()> {
        let key: E::Key = serde_json::from_value(value.clone()).map_err(|e| {
            AppError::serialization(self.descriptor.table(), self.descriptor.key_column(), e)
        })?;
        self.entity.write(|e| e.set_key(key));
        self.generated_key = true;
        Ok(())
    }

    fn reset_generated_key(&mut self) {
        if self.generated_key {
            self.entity.write(|e| e.set_key(E::Key::default()));
            self.generated_key = false;
        }
    }

    fn accept(&mut self) -> AppResult<()> {
        let snapshot = self.entity.read(|e| self.descriptor.snapshot(e))?;
        let key = self.entity.key();
        self.identity = Some(identity_of(&self.descriptor.key_value(&key)?));
        self.original = Some(snapshot);
        self.state = EntryState::Unchanged;
        self.full_update = false;
        self.stamped_at = None;
        self.generated_key = false;
        Ok(())
    }

    fn checkpoint(&self) -> Box<dyn EntryCheckpoint> {
        Box::new(SavedEntry {
            entry: self.clone(),
            value: self.entity.snapshot(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn is_timestamp<E: Entity>(descriptor: &EntityDescriptor<E>, name: &str) -> bool {
    descriptor
        .fields()
        .iter()
        .any(|f| f.name() == name && f.role().is_timestamp())
}

pub(crate) fn identity_of(key: &Value) -> String {
    key.to_string()
}

type IdentityKey = (TypeId, String);

/// 跟踪器检查点：条目列表及各实体当时的值
pub(crate) struct TrackerCheckpoint {
    entries: Vec<Box<dyn EntryCheckpoint>>,
}

impl TrackerCheckpoint {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 变更跟踪器
#[derive(Default)]
pub struct ChangeTracker {
    entries: Vec<Box<dyn TrackedEntry>>,
    index: HashMap<IdentityKey, usize>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.state().is_pending())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    fn identity<E: Entity>(descriptor: &EntityDescriptor<E>, key: &E::Key) -> AppResult<String> {
        Ok(identity_of(&descriptor.key_value(key)?))
    }

    fn position<E: Entity>(&self, identity: &str) -> Option<usize> {
        self.index
            .get(&(TypeId::of::<E>(), identity.to_string()))
            .copied()
    }

    fn typed<E: Entity>(&self, position: usize) -> Option<&EntityEntry<E>> {
        self.entries
            .get(position)
            .and_then(|entry| entry.as_any().downcast_ref::<EntityEntry<E>>())
    }

    fn push(&mut self, entry: Box<dyn TrackedEntry>) {
        if let Some(identity) = entry.identity() {
            self.index
                .insert((entry.entity_type(), identity.to_string()), self.entries.len());
        }
        self.entries.push(entry);
    }

    fn detach(&mut self, position: usize) {
        self.entries.remove(position);
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.identity().map(|id| ((e.entity_type(), id.to_string()), i)))
            .collect();
    }

    /// 按主键查找本地条目
    pub fn lookup<E: Entity>(
        &self,
        descriptor: &EntityDescriptor<E>,
        key: &E::Key,
    ) -> AppResult<Option<(EntryState, Tracked<E>)>> {
        let identity = Self::identity(descriptor, key)?;
        Ok(self
            .position::<E>(&identity)
            .and_then(|p| self.typed::<E>(p))
            .map(|entry| (entry.state, entry.entity.clone())))
    }

    pub fn state_of<E: Entity>(
        &self,
        descriptor: &EntityDescriptor<E>,
        key: &E::Key,
    ) -> AppResult<Option<EntryState>> {
        Ok(self.lookup(descriptor, key)?.map(|(state, _)| state))
    }

    /// 暂存插入
    pub fn add<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor<E>>,
        entity: E,
    ) -> AppResult<Tracked<E>> {
        let key_is_default = entity.key().is_default();
        if key_is_default {
            if descriptor.key_generation() == KeyGeneration::Provided {
                return Err(AppError::invalid_argument(format!(
                    "entity for `{}` has a default key",
                    descriptor.table()
                )));
            }
            let tracked = Tracked::new(entity);
            self.push(Box::new(EntityEntry::new(
                Arc::clone(descriptor),
                tracked.clone(),
                EntryState::Added,
                None,
                None,
            )));
            return Ok(tracked);
        }

        let identity = Self::identity(descriptor, entity.key())?;
        if let Some(position) = self.position::<E>(&identity) {
            return self.readd(position, entity);
        }

        let tracked = Tracked::new(entity);
        self.push(Box::new(EntityEntry::new(
            Arc::clone(descriptor),
            tracked.clone(),
            EntryState::Added,
            None,
            Some(identity),
        )));
        Ok(tracked)
    }

    /// 批量暂存插入：先整体校验，校验失败时不暂存任何实体
    pub fn add_many<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor<E>>,
        entities: Vec<E>,
    ) -> AppResult<Vec<Tracked<E>>> {
        let mut batch = std::collections::HashSet::new();
        for entity in &entities {
            if entity.key().is_default() {
                if descriptor.key_generation() == KeyGeneration::Provided {
                    ensure_key(descriptor, entity.key())?;
                }
                continue;
            }
            let identity = Self::identity(descriptor, entity.key())?;
            let tracked_live = self
                .position::<E>(&identity)
                .and_then(|p| self.typed::<E>(p))
                .is_some_and(|entry| entry.state != EntryState::Deleted);
            if tracked_live || !batch.insert(identity) {
                return Err(AppError::invalid_operation(format!(
                    "an entity with key {:?} is already tracked in `{}`",
                    entity.key(),
                    descriptor.table()
                )));
            }
        }

        entities
            .into_iter()
            .map(|entity| self.add(descriptor, entity))
            .collect()
    }

    fn readd<E: Entity>(&mut self, position: usize, entity: E) -> AppResult<Tracked<E>> {
        let entry = self.typed_mut::<E>(position)?;
        if entry.state != EntryState::Deleted {
            return Err(AppError::invalid_operation(format!(
                "an entity with key {:?} is already tracked in `{}`",
                entity.key(),
                entry.descriptor.table()
            )));
        }
        entry.entity.write(|e| *e = entity);
        entry.state = EntryState::Modified;
        Ok(entry.entity.clone())
    }

    fn typed_mut<E: Entity>(&mut self, position: usize) -> AppResult<&mut EntityEntry<E>> {
        let entry = self
            .entries
            .get_mut(position)
            .ok_or_else(|| AppError::internal("tracker index out of range"))?;
        entry
            .as_any_mut()
            .downcast_mut::<EntityEntry<E>>()
            .ok_or_else(|| AppError::internal("tracker entry type mismatch"))
    }

    /// 暂存更新
    pub fn update<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor<E>>,
        entity: E,
    ) -> AppResult<Tracked<E>> {
        ensure_key(descriptor, entity.key())?;
        let identity = Self::identity(descriptor, entity.key())?;

        if let Some(position) = self.position::<E>(&identity) {
            let entry = self.typed_mut::<E>(position)?;
            entry.entity.write(|e| *e = entity);
            if entry.state != EntryState::Added {
                entry.state = EntryState::Modified;
            }
            return Ok(entry.entity.clone());
        }

        let original = descriptor.snapshot(&entity)?;
        let tracked = Tracked::new(entity);
        let mut entry = EntityEntry::new(
            Arc::clone(descriptor),
            tracked.clone(),
            EntryState::Modified,
            Some(original),
            Some(identity),
        );
        entry.full_update = true;
        self.push(Box::new(entry));
        Ok(tracked)
    }

    /// 暂存删除；尚未插入的条目直接移除
    pub fn remove<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor<E>>,
        entity: &E,
    ) -> AppResult<()> {
        ensure_key(descriptor, entity.key())?;
        let identity = Self::identity(descriptor, entity.key())?;

        if let Some(position) = self.position::<E>(&identity) {
            let entry = self.typed_mut::<E>(position)?;
            if entry.state == EntryState::Added {
                self.detach(position);
            } else {
                entry.state = EntryState::Deleted;
            }
            return Ok(());
        }

        let original = descriptor.snapshot(entity)?;
        self.push(Box::new(EntityEntry::new(
            Arc::clone(descriptor),
            Tracked::new(entity.clone()),
            EntryState::Deleted,
            Some(original),
            Some(identity),
        )));
        Ok(())
    }

    /// 附加查询结果；已跟踪的实体返回本地值，已标记删除的返回 `None`
    pub fn attach<E: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor<E>>,
        entity: E,
    ) -> AppResult<Option<E>> {
        let identity = Self::identity(descriptor, entity.key())?;
        if let Some(position) = self.position::<E>(&identity) {
            let entry = self.typed_mut::<E>(position)?;
            return Ok(match entry.state {
                EntryState::Deleted => None,
                _ => Some(entry.entity.snapshot()),
            });
        }

        let original = descriptor.snapshot(&entity)?;
        self.push(Box::new(EntityEntry::new(
            Arc::clone(descriptor),
            Tracked::new(entity.clone()),
            EntryState::Unchanged,
            Some(original),
            Some(identity),
        )));
        Ok(Some(entity))
    }

    /// 为所有待写入条目写时间戳
    pub(crate) fn stamp_pending(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        for entry in &mut self.entries {
            if matches!(entry.state(), EntryState::Added | EntryState::Modified) {
                entry.stamp(now)?;
            }
        }
        Ok(())
    }

    /// 枚举待写入的变更（按暂存顺序）
    pub(crate) fn pending_mutations(&self) -> AppResult<Vec<PendingMutation>> {
        let mut mutations = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(mutation) = entry.pending_mutation(index)? {
                mutations.push(mutation);
            }
        }
        Ok(mutations)
    }

    pub(crate) fn resolve_generated_key(&mut self, entry: usize, value: &Value) -> AppResult<()> {
        self.entries
            .get_mut(entry)
            .ok_or_else(|| AppError::internal("tracker index out of range"))?
            .resolve_generated_key(value)
    }

    /// 提交失败：撤销本次回填的生成主键
    pub(crate) fn reset_generated_keys(&mut self) {
        for entry in &mut self.entries {
            entry.reset_generated_key();
        }
    }

    pub(crate) fn checkpoint(&self) -> TrackerCheckpoint {
        TrackerCheckpoint {
            entries: self.entries.iter().map(|e| e.checkpoint()).collect(),
        }
    }

    /// 回到检查点：之后暂存的条目被移除，已有条目恢复原状态与实体值
    pub(crate) fn restore(&mut self, checkpoint: TrackerCheckpoint) {
        self.entries = checkpoint
            .entries
            .into_iter()
            .map(|saved| saved.restore())
            .collect();
        self.reindex();
    }

    /// 提交成功：删除的条目分离，其余回到 Unchanged
    pub(crate) fn accept_all(&mut self) -> AppResult<()> {
        self.entries.retain(|e| e.state() != EntryState::Deleted);
        for entry in &mut self.entries {
            if entry.state().is_pending() {
                entry.accept()?;
            }
        }
        self.reindex();
        Ok(())
    }
}

fn ensure_key<E: Entity>(descriptor: &EntityDescriptor<E>, key: &E::Key) -> AppResult<()> {
    if key.is_default() {
        return Err(AppError::invalid_argument(format!(
            "entity for `{}` has a default key",
            descriptor.table()
        )));
    }
    Ok(())
}

//! 实体基础 trait

use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::EntityDescriptor;

/// 实体主键
///
/// 默认值（`Default::default()`）视为"未赋值"的主键
pub trait EntityKey:
    Clone + Default + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl<T> EntityKey for T where
    T: Clone + Default + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// 审计时间戳
///
/// `None` 表示尚未持久化 / 尚未修改，读取时不会替换为当前时间
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Timestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入时写入创建时间
    pub fn stamp_created(&mut self, now: DateTime<Utc>) {
        self.created_at = Some(now);
    }

    /// 更新时写入修改时间
    pub fn stamp_modified(&mut self, now: DateTime<Utc>) {
        self.modified_at = Some(now);
    }

    pub fn is_persisted(&self) -> bool {
        self.created_at.is_some()
    }
}

/// 实体 trait
pub trait Entity: Clone + Send + Sync + 'static {
    type Key: EntityKey;

    fn key(&self) -> &Self::Key;

    fn set_key(&mut self, key: Self::Key);

    fn timestamps(&self) -> &Timestamps;

    fn timestamps_mut(&mut self) -> &mut Timestamps;

    /// 注册期描述符：表名、主键列及字段读取器
    fn describe() -> EntityDescriptor<Self>;
}

/// 被跟踪实体的共享句柄
///
/// 提交成功后，数据库生成的主键会经由此句柄回写
pub struct Tracked<E> {
    inner: Arc<RwLock<E>>,
}

impl<E> Clone for Tracked<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Debug> Debug for Tracked<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f.debug_tuple("Tracked").field(&*guard).finish()
    }
}

impl<E: Entity> Tracked<E> {
    pub fn new(entity: E) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    /// 当前实体的副本
    pub fn snapshot(&self) -> E {
        self.read(Clone::clone)
    }

    pub fn key(&self) -> E::Key {
        self.read(|e| e.key().clone())
    }

    pub fn timestamps(&self) -> Timestamps {
        self.read(|e| *e.timestamps())
    }

    pub fn read<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// 是否指向同一个被跟踪实体
    pub fn same_entity(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

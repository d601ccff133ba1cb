//! 模型注册表
//!
//! 启动时构建一次，通过 `Arc` 显式传给需要描述符的组件

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use strata_errors::{AppError, AppResult};

use crate::{Entity, EntityDescriptor};

/// 模型注册表
#[derive(Default)]
pub struct ModelRegistry {
    descriptors: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    tables: HashMap<&'static str, &'static str>,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder {
            registry: ModelRegistry::default(),
        }
    }

    /// 获取实体描述符
    pub fn descriptor<E: Entity>(&self) -> AppResult<Arc<EntityDescriptor<E>>> {
        let entry = self.descriptors.get(&TypeId::of::<E>()).ok_or_else(|| {
            AppError::configuration(format!("entity `{}` is not registered", type_name::<E>()))
        })?;

        Arc::clone(entry)
            .downcast::<EntityDescriptor<E>>()
            .map_err(|_| AppError::internal(format!("descriptor type mismatch for `{}`", type_name::<E>())))
    }

    pub fn is_registered<E: Entity>(&self) -> bool {
        self.descriptors.contains_key(&TypeId::of::<E>())
    }

    /// 已注册的表名
    pub fn tables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tables.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("tables", &self.tables)
            .finish()
    }
}

/// 注册表构建器
pub struct ModelRegistryBuilder {
    registry: ModelRegistry,
}

impl ModelRegistryBuilder {
    /// 注册实体类型
    pub fn register<E: Entity>(mut self) -> AppResult<Self> {
        let descriptor = E::describe();
        descriptor.validate()?;

        if self.registry.descriptors.contains_key(&TypeId::of::<E>()) {
            return Err(AppError::configuration(format!(
                "entity `{}` is registered twice",
                type_name::<E>()
            )));
        }
        if let Some(existing) = self.registry.tables.get(descriptor.table()) {
            return Err(AppError::configuration(format!(
                "table `{}` is already mapped by `{}`",
                descriptor.table(),
                existing
            )));
        }

        self.registry
            .tables
            .insert(descriptor.table(), type_name::<E>());
        self.registry
            .descriptors
            .insert(TypeId::of::<E>(), Arc::new(descriptor));
        Ok(self)
    }

    pub fn build(self) -> Arc<ModelRegistry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::Teacher;

    #[test]
    fn test_register_and_lookup() {
        let registry = ModelRegistry::builder()
            .register::<Teacher>()
            .unwrap()
            .build();

        assert!(registry.is_registered::<Teacher>());
        assert_eq!(registry.len(), 1);

        let descriptor = registry.descriptor::<Teacher>().unwrap();
        assert_eq!(descriptor.table(), "teachers");
        assert_eq!(registry.tables().collect::<Vec<_>>(), vec!["teachers"]);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let result = ModelRegistry::builder()
            .register::<Teacher>()
            .unwrap()
            .register::<Teacher>();

        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_entity_lookup_fails() {
        let registry = ModelRegistry::builder().build();
        let err = registry.descriptor::<Teacher>().unwrap_err();

        assert_eq!(err.kind(), strata_errors::ErrorKind::Configuration);
        assert!(registry.is_empty());
    }
}

//! 实体描述符
//!
//! 每种实体类型在注册期声明一次 (列名, 读取器) 列表，
//! 变更跟踪与审计按描述符遍历字段，而非运行时反射。

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use strata_common::is_identifier;
use strata_errors::{AppError, AppResult};

use crate::Entity;

/// 字段名 → 值，按键有序
pub type FieldMap = BTreeMap<String, Value>;

/// 主键生成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGeneration {
    /// 由调用方提供
    #[default]
    Provided,
    /// 由数据库在插入时生成
    Database,
}

/// 字段角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Key,
    Column,
    CreatedAt,
    ModifiedAt,
}

impl FieldRole {
    pub fn is_timestamp(&self) -> bool {
        matches!(self, FieldRole::CreatedAt | FieldRole::ModifiedAt)
    }
}

type Getter<E> = Box<dyn Fn(&E) -> serde_json::Result<Value> + Send + Sync>;

/// 字段描述
pub struct FieldDescriptor<E> {
    name: &'static str,
    role: FieldRole,
    getter: Getter<E>,
}

impl<E> FieldDescriptor<E> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn role(&self) -> FieldRole {
        self.role
    }

    pub fn read(&self, entity: &E) -> serde_json::Result<Value> {
        (self.getter)(entity)
    }
}

impl<E> std::fmt::Debug for FieldDescriptor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish()
    }
}

/// 实体描述符
#[derive(Debug)]
pub struct EntityDescriptor<E> {
    table: &'static str,
    key_column: &'static str,
    key_generation: KeyGeneration,
    fields: Vec<FieldDescriptor<E>>,
    audited: bool,
}

impl<E: Entity> EntityDescriptor<E> {
    pub fn builder(table: &'static str) -> EntityDescriptorBuilder<E> {
        EntityDescriptorBuilder {
            table,
            key_column: "id",
            key_generation: KeyGeneration::Provided,
            fields: Vec::new(),
            created_column: "created_at",
            modified_column: "modified_at",
            audited: true,
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn key_column(&self) -> &'static str {
        self.key_column
    }

    pub fn key_generation(&self) -> KeyGeneration {
        self.key_generation
    }

    pub fn is_audited(&self) -> bool {
        self.audited
    }

    pub fn fields(&self) -> &[FieldDescriptor<E>] {
        &self.fields
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// 指定角色的列名
    pub fn column_for(&self, role: FieldRole) -> Option<&'static str> {
        self.fields.iter().find(|f| f.role == role).map(|f| f.name)
    }

    /// 主键序列化为 JSON 值
    pub fn key_value(&self, key: &E::Key) -> AppResult<Value> {
        serde_json::to_value(key).map_err(|e| AppError::serialization(self.table, self.key_column, e))
    }

    /// 读取全部字段（含主键与时间戳）
    pub fn snapshot(&self, entity: &E) -> AppResult<FieldMap> {
        self.fields
            .iter()
            .map(|field| {
                field
                    .read(entity)
                    .map(|value| (field.name.to_string(), value))
                    .map_err(|e| AppError::serialization(self.table, field.name, e))
            })
            .collect()
    }

    /// 校验表名、列名合法且不重复
    pub fn validate(&self) -> AppResult<()> {
        if !is_identifier(self.table) {
            return Err(AppError::configuration(format!(
                "table name `{}` is not a valid identifier",
                self.table
            )));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_identifier(field.name) {
                return Err(AppError::configuration(format!(
                    "column `{}` of `{}` is not a valid identifier",
                    field.name, self.table
                )));
            }
            if !seen.insert(field.name) {
                return Err(AppError::configuration(format!(
                    "column `{}` is declared more than once on `{}`",
                    field.name, self.table
                )));
            }
        }
        Ok(())
    }
}

/// 描述符构建器
pub struct EntityDescriptorBuilder<E> {
    table: &'static str,
    key_column: &'static str,
    key_generation: KeyGeneration,
    fields: Vec<FieldDescriptor<E>>,
    created_column: &'static str,
    modified_column: &'static str,
    audited: bool,
}

impl<E: Entity> EntityDescriptorBuilder<E> {
    /// 调用方提供的主键
    pub fn key(mut self, column: &'static str) -> Self {
        self.key_column = column;
        self.key_generation = KeyGeneration::Provided;
        self
    }

    /// 数据库生成的主键
    pub fn generated_key(mut self, column: &'static str) -> Self {
        self.key_column = column;
        self.key_generation = KeyGeneration::Database;
        self
    }

    /// 普通字段
    pub fn field<T, F>(mut self, name: &'static str, get: F) -> Self
    where
        T: Serialize + ?Sized,
        F: Fn(&E) -> &T + Send + Sync + 'static,
    {
        self.fields.push(FieldDescriptor {
            name,
            role: FieldRole::Column,
            getter: Box::new(move |entity: &E| serde_json::to_value(get(entity))),
        });
        self
    }

    /// 自定义时间戳列名（默认 `created_at` / `modified_at`）
    pub fn timestamp_columns(mut self, created: &'static str, modified: &'static str) -> Self {
        self.created_column = created;
        self.modified_column = modified;
        self
    }

    /// 是否参与审计（默认参与）
    pub fn audited(mut self, audited: bool) -> Self {
        self.audited = audited;
        self
    }

    pub fn build(self) -> EntityDescriptor<E> {
        let mut fields = Vec::with_capacity(self.fields.len() + 3);
        fields.push(FieldDescriptor {
            name: self.key_column,
            role: FieldRole::Key,
            getter: Box::new(|entity: &E| serde_json::to_value(entity.key())),
        });
        fields.extend(self.fields);
        fields.push(FieldDescriptor {
            name: self.created_column,
            role: FieldRole::CreatedAt,
            getter: Box::new(|entity: &E| serde_json::to_value(entity.timestamps().created_at)),
        });
        fields.push(FieldDescriptor {
            name: self.modified_column,
            role: FieldRole::ModifiedAt,
            getter: Box::new(|entity: &E| serde_json::to_value(entity.timestamps().modified_at)),
        });

        EntityDescriptor {
            table: self.table,
            key_column: self.key_column,
            key_generation: self.key_generation,
            fields,
            audited: self.audited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::{Teacher, teacher};
    use serde_json::json;

    #[test]
    fn test_descriptor_field_order() {
        let descriptor = Teacher::describe();
        let columns: Vec<_> = descriptor.column_names().collect();

        assert_eq!(
            columns,
            vec!["id", "name", "address", "created_at", "modified_at"]
        );
        assert_eq!(descriptor.key_generation(), KeyGeneration::Database);
        assert_eq!(descriptor.column_for(FieldRole::CreatedAt), Some("created_at"));
        assert!(descriptor.is_audited());
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_snapshot_reads_nested_values() {
        let descriptor = Teacher::describe();
        let snapshot = descriptor.snapshot(&teacher("Ada")).unwrap();

        assert_eq!(snapshot["id"], json!(0));
        assert_eq!(snapshot["name"], json!("Ada"));
        assert_eq!(
            snapshot["address"],
            json!({"city": "Lyon", "lines": ["1 rue Neuve"]})
        );
        assert_eq!(snapshot["created_at"], Value::Null);
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let descriptor = EntityDescriptor::<Teacher>::builder("teachers")
            .generated_key("id")
            .field("name", |t: &Teacher| &t.name)
            .field("name", |t: &Teacher| &t.name)
            .build();

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_identifiers() {
        let descriptor = EntityDescriptor::<Teacher>::builder("teachers; --")
            .generated_key("id")
            .build();

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_snapshot_surfaces_serialization_failure() {
        use std::collections::HashMap;

        #[derive(Clone)]
        struct Odd {
            id: String,
            tags: HashMap<(u8, u8), String>,
            timestamps: crate::Timestamps,
        }

        impl Entity for Odd {
            type Key = String;
            fn key(&self) -> &String {
                &self.id
            }
            fn set_key(&mut self, key: String) {
                self.id = key;
            }
            fn timestamps(&self) -> &crate::Timestamps {
                &self.timestamps
            }
            fn timestamps_mut(&mut self) -> &mut crate::Timestamps {
                &mut self.timestamps
            }
            fn describe() -> EntityDescriptor<Self> {
                EntityDescriptor::builder("odds")
                    .key("id")
                    .field("tags", |o: &Odd| &o.tags)
                    .build()
            }
        }

        let mut tags = HashMap::new();
        tags.insert((1, 2), "pair".to_string());
        let odd = Odd {
            id: "a".to_string(),
            tags,
            timestamps: crate::Timestamps::new(),
        };

        let err = Odd::describe().snapshot(&odd).unwrap_err();
        assert_eq!(err.kind(), strata_errors::ErrorKind::Serialization);
    }
}

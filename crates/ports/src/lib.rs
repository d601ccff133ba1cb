//! ports - 抽象 trait 层
//!
//! 仓储、工作单元与查询塑形的抽象接口，具体引擎由 adapters 实现

mod query;
mod repository;
mod unit_of_work;

pub use query::*;
pub use repository::*;
pub use unit_of_work::*;

pub use strata_common::{Page, PageRequest};
pub use strata_domain_core::{
    AuditAction, AuditChangeRecord, Entity, EntityKey, FieldMap, JsonSnapshotSerializer,
    SnapshotSerializer, Tracked,
};

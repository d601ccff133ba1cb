//! domain-core - 实体模型与审计记录
//!
//! 实体契约、注册期描述符、审计变更记录及快照序列化端口

mod audit;
mod descriptor;
mod entity;
mod registry;
mod snapshot;

pub use audit::*;
pub use descriptor::*;
pub use entity::*;
pub use registry::*;
pub use snapshot::*;

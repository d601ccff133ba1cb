//! 单元测试用实体

use strata_domain_core::{Entity, EntityDescriptor, Timestamps};

/// 调用方提供主键
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: String,
    pub body: String,
    pub tags: Vec<String>,
    pub timestamps: Timestamps,
}

impl Entity for Note {
    type Key = String;

    fn key(&self) -> &String {
        &self.id
    }

    fn set_key(&mut self, key: String) {
        self.id = key;
    }

    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    fn timestamps_mut(&mut self) -> &mut Timestamps {
        &mut self.timestamps
    }

    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::builder("notes")
            .key("id")
            .field("body", |n: &Note| &n.body)
            .field("tags", |n: &Note| &n.tags)
            .build()
    }
}

pub fn note(id: &str, body: &str) -> Note {
    Note {
        id: id.to_string(),
        body: body.to_string(),
        tags: vec!["draft".to_string()],
        timestamps: Timestamps::new(),
    }
}

/// 数据库生成主键
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    pub id: i64,
    pub label: String,
    pub timestamps: Timestamps,
}

impl Entity for Counter {
    type Key = i64;

    fn key(&self) -> &i64 {
        &self.id
    }

    fn set_key(&mut self, key: i64) {
        self.id = key;
    }

    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    fn timestamps_mut(&mut self) -> &mut Timestamps {
        &mut self.timestamps
    }

    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::builder("counters")
            .generated_key("id")
            .field("label", |c: &Counter| &c.label)
            .build()
    }
}

pub fn counter(label: &str) -> Counter {
    Counter {
        id: 0,
        label: label.to_string(),
        timestamps: Timestamps::new(),
    }
}

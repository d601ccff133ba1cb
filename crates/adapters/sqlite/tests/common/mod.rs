#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use strata_adapter_sqlite::{SqliteConfig, SqliteUnitOfWorkFactory, create_pool, ensure_audit_table};
use strata_common::ManualClock;
use strata_domain_core::{Entity, EntityDescriptor, ModelRegistry, Timestamps};
use tempfile::TempDir;

pub const AUDIT_TABLE: &str = "audit_changes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub lines: Vec<String>,
}

/// 数据库生成主键的实体
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Teacher {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[sqlx(json)]
    pub address: Address,
    #[sqlx(flatten)]
    pub timestamps: Timestamps,
}

impl Entity for Teacher {
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
        EntityDescriptor::builder("teachers")
            .generated_key("id")
            .field("name", |t: &Teacher| &t.name)
            .field("email", |t: &Teacher| &t.email)
            .field("address", |t: &Teacher| &t.address)
            .build()
    }
}

pub fn teacher(name: &str) -> Teacher {
    Teacher {
        id: 0,
        name: name.to_string(),
        email: format!("{}@school.test", name.to_lowercase()),
        address: Address {
            city: "Lyon".to_string(),
            lines: vec!["1 Rue de la Paix".to_string()],
        },
        timestamps: Timestamps::new(),
    }
}

/// 调用方提供主键的实体
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Course {
    pub code: String,
    pub title: String,
    pub credits: i64,
    #[sqlx(flatten)]
    pub timestamps: Timestamps,
}

impl Entity for Course {
    type Key = String;

    fn key(&self) -> &String {
        &self.code
    }

    fn set_key(&mut self, key: String) {
        self.code = key;
    }

    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    fn timestamps_mut(&mut self) -> &mut Timestamps {
        &mut self.timestamps
    }

    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::builder("courses")
            .key("code")
            .field("title", |c: &Course| &c.title)
            .field("credits", |c: &Course| &c.credits)
            .build()
    }
}

pub fn course(code: &str, credits: i64) -> Course {
    Course {
        code: code.to_string(),
        title: format!("Course {}", code),
        credits,
        timestamps: Timestamps::new(),
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
}

/// 临时目录中的文件数据库
pub struct TestDb {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<ModelRegistry>,
    pub factory: SqliteUnitOfWorkFactory,
}

pub async fn setup() -> TestDb {
    strata_telemetry::init_test_tracing();

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("strata.db").display());
    let pool = create_pool(&SqliteConfig::new(url)).await.unwrap();

    sqlx::query(
        r#"
        CREATE TABLE teachers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            address TEXT NOT NULL,
            created_at TEXT,
            modified_at TEXT
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        CREATE TABLE courses (
            code TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            credits INTEGER NOT NULL CHECK (credits >= 0),
            created_at TEXT,
            modified_at TEXT
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    ensure_audit_table(&pool, AUDIT_TABLE).await.unwrap();

    let registry = ModelRegistry::builder()
        .register::<Teacher>()
        .unwrap()
        .register::<Course>()
        .unwrap()
        .build();
    let clock = Arc::new(ManualClock::new(start_time()));
    let factory =
        SqliteUnitOfWorkFactory::new(pool.clone(), Arc::clone(&registry)).with_clock(clock.clone());

    TestDb {
        dir,
        pool,
        clock,
        registry,
        factory,
    }
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

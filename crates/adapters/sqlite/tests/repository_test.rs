mod common;

use chrono::Duration;
use common::{Course, Teacher, course, setup, start_time, teacher};
use strata_adapter_sqlite::{SqlRepository, SqliteUnitOfWork};
use strata_errors::ErrorKind;
use strata_ports::{Condition, ExtendedRepository, Navigation, Repository, UnitOfWork};

async fn seed_courses(unit: &SqliteUnitOfWork, count: usize) {
    let courses = unit.repository::<Course>().unwrap();
    for i in 0..count {
        courses
            .add(course(&format!("C{:02}", i), i as i64))
            .await
            .unwrap();
    }
    unit.commit().await.unwrap();
}

#[tokio::test]
async fn test_generated_key_is_visible_after_commit() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let teachers = unit.repository::<Teacher>().unwrap();

    let first = teachers.add(teacher("Ada")).await.unwrap();
    let second = teachers.add(teacher("Grace")).await.unwrap();
    assert_eq!(first.key(), 0);

    let summary = unit.commit().await.unwrap();

    assert_eq!(summary.added, 2);
    assert_eq!(summary.audit_records, 2);
    assert!(first.key() > 0);
    assert!(second.key() > first.key());

    let loaded = teachers.get(&first.key(), None).await.unwrap().unwrap();
    assert_eq!(loaded.name, "Ada");
    assert_eq!(loaded.address.city, "Lyon");
}

#[tokio::test]
async fn test_insert_stamps_created_at_only() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    let tracked = courses.add(course("MATH", 3)).await.unwrap();
    unit.commit().await.unwrap();

    let fresh = db.factory.create().unwrap();
    let stored = fresh
        .repository::<Course>()
        .unwrap()
        .get(&"MATH".to_string(), None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stored.timestamps.created_at, Some(start_time()));
    assert_eq!(stored.timestamps.modified_at, None);
    assert_eq!(tracked.timestamps(), stored.timestamps);
}

#[tokio::test]
async fn test_update_stamps_modified_at_and_keeps_created_at() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    seed_courses(&unit, 1).await;

    db.clock.advance(Duration::hours(2));
    let fresh = db.factory.create().unwrap();
    let courses = fresh.repository::<Course>().unwrap();
    let mut loaded = courses.get(&"C00".to_string(), None).await.unwrap().unwrap();
    loaded.title = "Renamed".to_string();
    loaded.timestamps.created_at = None;
    courses.update(loaded).await.unwrap();
    let summary = fresh.commit().await.unwrap();

    assert_eq!(summary.modified, 1);
    let reader = db.factory.create().unwrap();
    let stored = reader
        .repository::<Course>()
        .unwrap()
        .get(&"C00".to_string(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.title, "Renamed");
    assert_eq!(stored.timestamps.created_at, Some(start_time()));
    assert_eq!(
        stored.timestamps.modified_at,
        Some(start_time() + Duration::hours(2))
    );
}

#[tokio::test]
async fn test_exists_sees_staged_insert_before_commit() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    courses.add(course("BIO", 2)).await.unwrap();

    assert!(courses.exists(&"BIO".to_string()).await.unwrap());
    assert!(courses.get(&"BIO".to_string(), None).await.unwrap().is_some());
    assert_eq!(courses.count(None).await.unwrap(), 0);
    assert!(unit.has_changes().await.unwrap());
}

#[tokio::test]
async fn test_staged_delete_hides_entity() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    seed_courses(&unit, 2).await;
    let courses = unit.repository::<Course>().unwrap();

    assert!(courses.remove_by_key(&"C00".to_string()).await.unwrap());

    assert!(!courses.exists(&"C00".to_string()).await.unwrap());
    assert!(courses.get(&"C00".to_string(), None).await.unwrap().is_none());
    assert_eq!(courses.get_all(None).await.unwrap().len(), 1);

    unit.commit().await.unwrap();
    assert_eq!(courses.count(None).await.unwrap(), 1);
    assert!(!courses.remove_by_key(&"C00".to_string()).await.unwrap());
}

#[tokio::test]
async fn test_get_missing_key_is_none() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let teachers = unit.repository::<Teacher>().unwrap();

    assert!(teachers.get(&404, None).await.unwrap().is_none());
    assert!(!teachers.exists(&404).await.unwrap());
}

#[tokio::test]
async fn test_default_keys_fail_fast() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    let err = courses.get(&String::new(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = courses.add(course("", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = courses.exists(&String::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let teachers = unit.repository::<Teacher>().unwrap();
    let err = teachers.update(teacher("Nobody")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    assert!(!unit.has_changes().await.unwrap());
}

#[tokio::test]
async fn test_unsigned_filter_beyond_i64_is_rejected() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    let huge = Navigation::filter(Condition::gt("credits", u64::MAX));
    let err = courses.count(Some(&huge)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = courses.get_all(Some(&huge)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_navigation_filters_and_orders() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    seed_courses(&unit, 6).await;
    let courses = unit.repository::<Course>().unwrap();

    let heavy = Navigation::filter(Condition::ge("credits", 3));
    let newest_first = Navigation::new(|s| s.order_desc("credits"));
    let found = courses
        .get_all(Some(&heavy.then(&newest_first)))
        .await
        .unwrap();

    let codes: Vec<_> = found.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["C05", "C04", "C03"]);
    assert_eq!(courses.count(Some(&heavy)).await.unwrap(), 3);
    assert!(courses.exists_where(&heavy).await.unwrap());
    assert!(
        !courses
            .exists_where(&Navigation::filter(Condition::gt("credits", 100)))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_navigation_does_not_find_missing_key_match() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    seed_courses(&unit, 3).await;
    let courses = unit.repository::<Course>().unwrap();

    let only_heavy = Navigation::filter(Condition::ge("credits", 2));

    assert!(
        courses
            .get(&"C01".to_string(), Some(&only_heavy))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        courses
            .get(&"C02".to_string(), Some(&only_heavy))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_unknown_column_is_invalid_argument() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    let err = courses
        .get_all(Some(&Navigation::filter(Condition::eq("nope", 1))))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_get_page_boundaries() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    let empty = courses.get_page(1, 10, None).await.unwrap();
    assert!(empty.items.is_empty());
    assert_eq!(empty.total_count, 0);

    seed_courses(&unit, 5).await;

    let second = courses.get_page(2, 2, None).await.unwrap();
    let codes: Vec<_> = second.items.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["C02", "C03"]);
    assert_eq!(second.total_count, 5);
    assert_eq!(second.total_pages(), 3);
    assert!(second.has_next());

    let beyond = courses.get_page(9, 2, None).await.unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total_count, 5);

    let err = courses.get_page(0, 2, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = courses.get_page(1, 0, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_get_page_respects_filter_and_ordering() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    seed_courses(&unit, 6).await;
    let courses = unit.repository::<Course>().unwrap();

    let navigation = Navigation::new(|s| {
        s.filter(Condition::lt("credits", 4))
            .order_desc("credits")
            .limit(1)
    });
    let page = courses.get_page(1, 3, Some(&navigation)).await.unwrap();

    let codes: Vec<_> = page.items.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["C03", "C02", "C01"]);
    assert_eq!(page.total_count, 4);
}

#[tokio::test]
async fn test_add_or_update_inserts_then_updates() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    courses.add_or_update(course("ART", 1)).await.unwrap();
    unit.commit().await.unwrap();

    db.clock.advance(Duration::minutes(30));
    let mut changed = course("ART", 4);
    changed.title = "Art History".to_string();
    let fresh = db.factory.create().unwrap();
    fresh
        .repository::<Course>()
        .unwrap()
        .add_or_update(changed)
        .await
        .unwrap();
    let summary = fresh.commit().await.unwrap();
    assert_eq!(summary.modified, 1);

    let stored = courses.get_all(None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].credits, 4);
    assert_eq!(stored[0].timestamps.created_at, Some(start_time()));
    assert_eq!(
        stored[0].timestamps.modified_at,
        Some(start_time() + Duration::minutes(30))
    );
}

#[tokio::test]
async fn test_conditional_variants() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    assert!(courses.update_if_exists(course("GEO", 1)).await.unwrap().is_none());
    assert!(courses.add_if_not_exists(course("GEO", 1)).await.unwrap().is_some());
    assert!(courses.add_if_not_exists(course("GEO", 2)).await.unwrap().is_none());
    unit.commit().await.unwrap();

    assert!(courses.update_if_exists(course("GEO", 5)).await.unwrap().is_some());
    unit.commit().await.unwrap();

    let stored = courses.get(&"GEO".to_string(), None).await.unwrap().unwrap();
    assert_eq!(stored.credits, 5);
}

#[tokio::test]
async fn test_batch_staging() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    let courses = unit.repository::<Course>().unwrap();

    let staged = courses
        .add_many(vec![course("A1", 1), course("A2", 2), course("A3", 3)])
        .await
        .unwrap();
    assert_eq!(staged.len(), 3);
    unit.commit().await.unwrap();

    let mut all = courses.get_all(None).await.unwrap();
    for c in &mut all {
        c.credits += 10;
    }
    courses.update_many(all.clone()).await.unwrap();
    courses.remove_many(&all[..1]).await.unwrap();
    let summary = unit.commit().await.unwrap();

    assert_eq!(summary.modified, 2);
    assert_eq!(summary.deleted, 1);
    let credits: Vec<_> = courses
        .get_all(None)
        .await
        .unwrap()
        .iter()
        .map(|c| c.credits)
        .collect();
    assert_eq!(credits, vec![12, 13]);
}

#[tokio::test]
async fn test_no_tracking_query_skips_identity_resolution() {
    let db = setup().await;
    let unit = db.factory.create().unwrap();
    seed_courses(&unit, 1).await;
    let courses = unit.repository::<Course>().unwrap();

    let mut local = courses.get(&"C00".to_string(), None).await.unwrap().unwrap();
    local.title = "Local edit".to_string();
    courses.update(local).await.unwrap();

    let tracked = courses.get_all(None).await.unwrap();
    let raw = courses
        .get_all(Some(&Navigation::new(|s| s.no_tracking())))
        .await
        .unwrap();

    assert_eq!(tracked[0].title, "Local edit");
    assert_eq!(raw[0].title, "Course C00");
}

#[tokio::test]
async fn test_repository_from_standalone_context() {
    let db = setup().await;
    let context = db.factory.context().unwrap();
    let teachers = SqlRepository::<Teacher>::new(&context).unwrap();

    teachers.add(teacher("Ada")).await.unwrap();
    context.save_changes().await.unwrap();

    assert_eq!(teachers.count(None).await.unwrap(), 1);
}

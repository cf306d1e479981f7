use super::*;
use crate::config::DatabaseConfig;
use crate::db;
use crate::hooker::HookOptions;
use crate::types::{Point, ScheduleSpec};

const EXID_A: &str = "test-u0-20261017.0930.aaaaaaaa";
const EXID_B: &str = "test-u0-20261017.0930.bbbbbbbb";

fn schedule_message(exid: &str, nid: &str, schedule: ScheduleSpec) -> Message {
    let mut message = Message::new(Point::Schedule, exid, nid);
    message.schedule = Some(schedule);
    message.message = Some(Box::new(Message::new(Point::Receive, exid, nid).from_nid(nid)));
    message
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_takes_messages_of_one_exid_in_order() {
    let storage = MemoryStorage::new();
    storage.put_message(&Message::new(Point::Signal, EXID_A, "0").with_name("one")).await.unwrap();
    storage.put_message(&Message::new(Point::Signal, EXID_B, "0").with_name("other")).await.unwrap();
    storage.put_message(&Message::new(Point::Signal, EXID_A, "0").with_name("two")).await.unwrap();

    let names: Vec<Option<String>> = storage
        .fetch_messages(EXID_A)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec![Some("one".to_string()), Some("two".to_string())]);

    assert!(storage.fetch_messages(EXID_A).await.unwrap().is_empty());
    assert_eq!(storage.pending_messages().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loaded_messages_are_consumed_or_released() {
    let storage = MemoryStorage::new();
    storage.put_message(&Message::new(Point::Signal, EXID_A, "0").with_name("one")).await.unwrap();
    storage.put_message(&Message::new(Point::Signal, EXID_B, "0").with_name("other")).await.unwrap();

    assert_eq!(storage.fetch_messages(EXID_A).await.unwrap().len(), 1);
    assert_eq!(storage.load_exids().await.unwrap(), vec![EXID_B]);

    storage.release_messages(EXID_A).await.unwrap();
    assert_eq!(storage.load_exids().await.unwrap(), vec![EXID_A, EXID_B]);

    // arrived while the batch was out, stays pending
    assert_eq!(storage.fetch_messages(EXID_A).await.unwrap().len(), 1);
    storage.put_message(&Message::new(Point::Signal, EXID_A, "0").with_name("two")).await.unwrap();
    storage.consume_messages(EXID_A).await.unwrap();

    let names: Vec<Option<String>> = storage
        .fetch_messages(EXID_A)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec![Some("two".to_string())]);
    assert_eq!(storage.pending_messages().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_exids_oldest_first_without_duplicates() {
    let storage = MemoryStorage::new();
    storage.put_message(&Message::new(Point::Signal, EXID_B, "0")).await.unwrap();
    storage.put_message(&Message::new(Point::Signal, EXID_A, "0")).await.unwrap();
    storage.put_message(&Message::new(Point::Signal, EXID_B, "0")).await.unwrap();

    assert_eq!(storage.load_exids().await.unwrap(), vec![EXID_B, EXID_A]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_shot_timer_fires_once() {
    let storage = MemoryStorage::new();
    let timer = storage
        .put_timer(&schedule_message(EXID_A, "0_1", ScheduleSpec::In("1s".into())))
        .await
        .unwrap();
    assert_eq!(timer.nid, "0_1");
    assert!(timer.ntime > Utc::now());

    assert!(storage.trigger_timer(&timer).await.unwrap().is_none());
    assert!(storage.load_timers().await.unwrap().is_empty());

    // gone already, nothing more is queued
    assert!(storage.trigger_timer(&timer).await.unwrap().is_none());

    let queued = storage.fetch_messages(EXID_A).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].point, Point::Receive);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recurring_timer_is_rescheduled() {
    let storage = MemoryStorage::new();
    let timer = storage
        .put_timer(&schedule_message(EXID_A, "0", ScheduleSpec::Every("1h".into())))
        .await
        .unwrap();

    let next = storage.trigger_timer(&timer).await.unwrap().expect("rescheduled");
    assert_eq!(next.id, timer.id);
    assert_eq!(next.count, 1);
    assert!(next.ntime >= timer.ntime);
    assert_eq!(storage.load_timers().await.unwrap(), vec![next]);
    assert_eq!(storage.pending_messages().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timers_sorted_and_removed_by_node() {
    let storage = MemoryStorage::new();
    storage
        .put_timer(&schedule_message(EXID_A, "0_0", ScheduleSpec::In("2h".into())))
        .await
        .unwrap();
    storage
        .put_timer(&schedule_message(EXID_A, "0_1", ScheduleSpec::In("1h".into())))
        .await
        .unwrap();
    storage
        .put_timer(&schedule_message(EXID_B, "0_1", ScheduleSpec::In("3h".into())))
        .await
        .unwrap();

    let nids: Vec<(String, String)> = storage
        .load_timers()
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.exid, t.nid))
        .collect();
    assert_eq!(
        nids,
        vec![
            (EXID_A.to_string(), "0_1".to_string()),
            (EXID_A.to_string(), "0_0".to_string()),
            (EXID_B.to_string(), "0_1".to_string()),
        ]
    );

    storage.remove_timers(EXID_A, "0_1").await.unwrap();
    assert_eq!(storage.load_timers().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreadable_schedule_is_rejected() {
    let storage = MemoryStorage::new();
    let result = storage
        .put_timer(&schedule_message(EXID_A, "0", ScheduleSpec::In("whenever".into())))
        .await;
    assert!(result.is_err());

    let bare = Message::new(Point::Schedule, EXID_A, "0");
    assert!(storage.put_timer(&bare).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_traps_visibility_and_removal() {
    let storage = MemoryStorage::new();

    let own = Trap::new(EXID_A, "0_0", "0", HookOptions::new().exid(EXID_A));
    let mut global = Trap::new(EXID_B, "0_3", "0_3", HookOptions::new());
    global.created_at = own.created_at - chrono::Duration::seconds(1);
    let foreign = Trap::new(EXID_B, "0_4", "0_4", HookOptions::new().exid(EXID_B));

    for trap in [&own, &global, &foreign] {
        storage.put_trap(&trap.nid, trap).await.unwrap();
    }

    let ids: Vec<Uuid> = storage.load_traps(EXID_A).await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![global.id, own.id]);

    // updates in place
    let mut counted = own.clone();
    counted.count = Some(2);
    storage.put_trap(&counted.nid, &counted).await.unwrap();
    let traps = storage.load_traps(EXID_A).await.unwrap();
    assert_eq!(traps.len(), 2);
    assert_eq!(traps[1].count, Some(2));

    storage.remove_traps(EXID_A, "0").await.unwrap();
    assert_eq!(storage.load_traps(EXID_A).await.unwrap().len(), 1);

    storage.remove_trap(foreign.id).await.unwrap();
    assert_eq!(storage.load_traps(EXID_B).await.unwrap().len(), 1);
}

#[test]
fn test_memory_storage_is_always_ready() {
    let storage = MemoryStorage::new();
    assert!(tokio_test::block_on(storage.ready()).unwrap());
    assert_eq!(storage.identity(), "memory");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_pg_roundtrip() {
    let config = DatabaseConfig {
        url: std::env::var("CADENCE_DATABASE_URL").ok(),
        ..DatabaseConfig::default()
    };
    let pool = db::connect(&config).await.unwrap();
    db::migrate(&pool).await.unwrap();
    let storage = PgStorage::new(pool);
    assert!(storage.ready().await.unwrap());

    let exid = crate::ids::generate_exid("test", "u0");
    storage.put_message(&Message::new(Point::Signal, &exid, "0").with_name("a")).await.unwrap();
    storage.put_message(&Message::new(Point::Signal, &exid, "0").with_name("b")).await.unwrap();
    assert!(storage.load_exids().await.unwrap().contains(&exid));

    let names: Vec<Option<String>> = storage
        .fetch_messages(&exid)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec![Some("a".to_string()), Some("b".to_string())]);

    let mut execution = Execution::new(exid.clone());
    execution.counters.msgs = 3;
    storage.put_execution(&execution).await.unwrap();
    let loaded = storage.load_execution(&exid).await.unwrap().expect("execution");
    assert_eq!(loaded.counters.msgs, 3);

    let timer = storage
        .put_timer(&schedule_message(&exid, "0", ScheduleSpec::In("1s".into())))
        .await
        .unwrap();
    assert!(storage.trigger_timer(&timer).await.unwrap().is_none());
    assert_eq!(storage.fetch_messages(&exid).await.unwrap().len(), 1);

    storage.shutdown().await;
}

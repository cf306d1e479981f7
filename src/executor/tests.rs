use super::*;
use crate::hooker::HookOptions;
use crate::storage::Storage;
use crate::test_helpers::{fast_config, flaky_scheduler, launch_message, memory_scheduler, EXID};
use crate::types::{ExecutionStatus, Point};
use serde_json::json;

async fn run_once(scheduler: &Scheduler) {
    Executor::new(scheduler.clone(), EXID).run().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_drains_and_saves_the_execution() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(EXID, json!(["sequence", [["_num", 1, 2]], 1])))
        .await
        .unwrap();

    run_once(&scheduler).await;

    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert_eq!(execution.counters.runs, 1);
    assert!(execution.counters.msgs > 0);
    assert!(execution.nodes.is_empty());
    assert!(storage.pending_messages().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_resumes_a_saved_execution() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(EXID, json!(["sequence", [["stall", [], 2]], 1])))
        .await
        .unwrap();
    run_once(&scheduler).await;

    let saved = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Active);
    assert_eq!(saved.nodes.len(), 2);

    storage.put_message(&Message::new(Point::Cancel, EXID, "0")).await.unwrap();
    run_once(&scheduler).await;

    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert_eq!(execution.counters.runs, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timers_are_stored_and_dropped_with_their_node() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(
            EXID,
            json!(["sequence", [["sleep", [["_att", [["_sqs", "1h", 2]], 2]], 2]], 1]),
        ))
        .await
        .unwrap();
    run_once(&scheduler).await;

    let timers = storage.load_timers().await.unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].nid, "0_0");

    // cancelling the sleeper removes its node, and its timer with it
    storage.put_message(&Message::new(Point::Cancel, EXID, "0")).await.unwrap();
    run_once(&scheduler).await;

    assert!(storage.load_timers().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fired_timer_wakes_the_sleeper() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(
            EXID,
            json!(["sequence", [["sleep", [["_att", [["_sqs", "1h", 2]], 2]], 2]], 1]),
        ))
        .await
        .unwrap();
    run_once(&scheduler).await;

    let timer = storage.load_timers().await.unwrap().remove(0);
    assert!(storage.trigger_timer(&timer).await.unwrap().is_none());
    run_once(&scheduler).await;

    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_traps_are_persisted_until_spent() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(
            EXID,
            json!(["sequence", [["trap", [["_att", [["point", [], 2], ["_sqs", "signal", 2]], 2]], 2]], 1]),
        ))
        .await
        .unwrap();
    run_once(&scheduler).await;
    assert_eq!(storage.load_traps(EXID).await.unwrap().len(), 1);

    storage
        .put_message(&Message::new(Point::Signal, EXID, "0").with_name("go"))
        .await
        .unwrap();
    run_once(&scheduler).await;

    assert!(storage.load_traps(EXID).await.unwrap().is_empty());
    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removed_nodes_are_archived() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    scheduler.enable_archive();
    storage
        .put_message(&launch_message(EXID, json!(["sequence", [["_num", 1, 2]], 1])))
        .await
        .unwrap();

    run_once(&scheduler).await;

    let archive = scheduler.archive(EXID).unwrap();
    assert!(archive.contains_key("0"));
    assert!(archive.contains_key("0_0"));
    assert_eq!(archive["0"].heap.as_deref(), Some("sequence"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_for_other_executions_are_queued() {
    const OTHER: &str = "test-u0-20261017.0930.otherone";

    let (scheduler, storage) = memory_scheduler(fast_config());
    scheduler.hook_fn(
        Some("relay"),
        HookOptions::new().points([Point::Terminated]).consumed(true),
        |_| {
            let ping = Message::new(Point::Signal, OTHER, "0").with_name("ping");
            json!([serde_json::to_value(ping).unwrap()])
        },
    );
    storage
        .put_message(&launch_message(EXID, json!(["_num", 1, 1])))
        .await
        .unwrap();

    run_once(&scheduler).await;

    let pending = storage.pending_messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].exid, OTHER);
    assert_eq!(pending[0].name.as_deref(), Some("ping"));

    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.counters.omsgs, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_traces_are_saved() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(
            EXID,
            json!(["sequence", [
                ["trace", [["_att", [["_sqs", "a", 2]], 2]], 2],
                ["trace", [["_att", [["_sqs", "b", 3]], 3]], 3]
            ], 1]),
        ))
        .await
        .unwrap();

    run_once(&scheduler).await;

    let texts: Vec<String> = storage
        .load_traces(EXID)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.text)
        .collect();
    assert_eq!(texts, vec!["a", "b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_nodes_keep_their_structural_parent() {
    let (scheduler, storage) = memory_scheduler(fast_config());
    storage
        .put_message(&launch_message(
            EXID,
            json!(["concurrence", [
                ["sequence", [["stall", [], 3]], 2],
                ["sequence", [["_num", 1, 5], ["stall", [], 6]], 4]
            ], 1]),
        ))
        .await
        .unwrap();

    run_once(&scheduler).await;

    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.nodes.len(), 5);
    for (nid, node) in &execution.nodes {
        assert_eq!(node.parent, crate::ids::parent_id(nid), "parent of {}", nid);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_batch_is_released_and_replayed() {
    let (scheduler, storage) = flaky_scheduler(fast_config(), 1);
    storage
        .put_message(&launch_message(
            EXID,
            json!(["sequence", [
                ["trace", [["_att", [["_sqs", "a", 2]], 2]], 2],
                ["trace", [["_att", [["_sqs", "b", 3]], 3]], 3]
            ], 1]),
        ))
        .await
        .unwrap();

    let err = Executor::new(scheduler.clone(), EXID).run().await.unwrap_err();
    assert!(format!("{:#}", err).contains("trace table unavailable"));

    // nothing saved, the launch is pending again
    assert!(storage.load_execution(EXID).await.unwrap().is_none());
    let pending = storage.inner.pending_messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].point, Point::Execute);
    assert_eq!(storage.load_exids().await.unwrap(), vec![EXID]);

    run_once(&scheduler).await;

    let execution = storage.load_execution(EXID).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    let texts: Vec<String> = storage
        .load_traces(EXID)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.text)
        .collect();
    assert_eq!(texts, vec!["a", "b"]);
    assert!(storage.inner.pending_messages().is_empty());
}

//! Process stages, run against the bundled `mpipeline-worker` host.

use mpipeline::prelude::*;
use mpipeline::progress::CollectingProgress;
use mpipeline::testing::{Doubler, ToText};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn worker_host() -> StartMethod {
    StartMethod::program(env!("CARGO_BIN_EXE_mpipeline-worker"))
}

fn process_stage(entry: &str, workers: usize) -> Stage<i64, i64> {
    Stage::process(entry, workers).with_start_method(worker_host())
}

fn markers(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, Iterator::count)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_stage_round_trip() {
    let pipeline = Pipeline::new(process_stage("Doubler", 2));
    let outputs = pipeline
        .run(1..=5, RunOptions::default())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(outputs, vec![2, 4, 6, 8, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mixed_thread_and_process_stages() {
    let pipeline = Pipeline::new(Stage::thread(2, || Ok(Doubler)))
        | process_stage("AddOne", 2)
        | Stage::thread(1, || Ok(ToText));

    let outputs = pipeline
        .run(vec![1, 2, 3], RunOptions::default())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(outputs, vec!["3", "5", "7"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_failure_carries_input() {
    let pipeline = Pipeline::new(Stage::thread(1, || Ok(Doubler)))
        | process_stage("AddOne", 2).with_args(json!({"fail_on": 6}));

    let err = pipeline
        .run(1..=10, RunOptions::default())
        .unwrap()
        .collect_all()
        .await
        .unwrap_err();

    let worker = err.worker_error().expect("worker failure");
    assert_eq!(worker.kind(), FailureKind::Processing);
    assert_eq!(worker.worker_type(), "AddOne");
    assert_eq!(worker.stage_index(), 1);
    assert_eq!(worker.input_as::<i64>(), Some(&6));
    assert!(worker.original().to_string().contains("AddOne refuses 6"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_worker_is_initialization_failure() {
    let pipeline = Pipeline::new(process_stage("NoSuchWorker", 1));
    let err = pipeline
        .run(vec![1], RunOptions::default())
        .unwrap()
        .collect_all()
        .await
        .unwrap_err();

    let worker = err.worker_error().expect("worker failure");
    assert_eq!(worker.kind(), FailureKind::Initialization);
    assert!(worker.original().to_string().contains("no worker registered"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_processes_dispose_on_completion() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(process_stage("DisposeMarker", 2).with_args(json!({ "dir": dir.path() })));

    let outputs = pipeline
        .run(0..20, RunOptions::default())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(outputs.len(), 20);
    let disposed = markers(dir.path());
    assert!((1..=2).contains(&disposed), "unexpected dispose count {disposed}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_process_run_disposes_workers() {
    let dir = tempfile::tempdir().unwrap();
    let progress = Arc::new(CollectingProgress::new());
    let pipeline = Pipeline::new(process_stage("DisposeMarker", 1).with_args(json!({ "dir": dir.path() })));

    let mut run = pipeline
        .run_with_reporter(0..10_000, RunOptions::default(), progress.clone())
        .unwrap();
    assert_eq!(run.next().await.unwrap().unwrap(), 0);
    drop(run);

    tokio::time::timeout(Duration::from_secs(20), async {
        while progress.run_ends() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("run never ended");

    assert_eq!(markers(dir.path()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unordered_process_stage_is_complete() {
    let pipeline = Pipeline::new(
        process_stage("Sleepy", 3).with_args(json!({"millis": 1, "skew": 30})),
    ) | Stage::thread(1, || Ok(Doubler));

    let mut outputs = pipeline
        .run(0..30, RunOptions::default().with_ordered(false))
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    outputs.sort_unstable();
    assert_eq!(outputs, (0..30).map(|x| x * 2).collect::<Vec<_>>());
}

#[test]
fn test_runtime_shutdown_after_abandon_disposes_workers() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pipeline = Pipeline::new(process_stage("DisposeMarker", 1).with_args(json!({ "dir": dir.path() })));

    runtime.block_on(async {
        let mut run = pipeline.run(0..10_000, RunOptions::default()).unwrap();
        assert_eq!(run.next().await.unwrap().unwrap(), 0);
        drop(run);
    });
    drop(runtime);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while markers(dir.path()) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(markers(dir.path()), 1);
}

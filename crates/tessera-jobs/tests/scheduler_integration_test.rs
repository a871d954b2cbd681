//! Integration tests for the coalescing scheduler.
//!
//! This test suite validates:
//! - Matching queued tasks collapse into one run of the latest payload
//! - Non-matching tasks all run
//! - Replacement keeps the original queue position
//! - Repeated re-submission of one key does not starve other work
//! - A running task is never replaced by a later submission
//! - Failing, panicking and timed-out tasks do not affect other tasks
//! - Shutdown drops queued work; flush runs it
//! - Capacity overflow evicts the oldest queued task and reports its kind
//!
//! Tests pause the scheduler while submitting so that coalescing does not
//! depend on how fast the workers pick up tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::mock::RecordingIndexer;
use tessera_jobs::{
    Coalescing, DocumentSnapshot, Error, IndexDocumentTask, Indexer, ReindexProjectTask, Result,
    Scheduler, SchedulerConfig, SchedulerEvent, SubmitOutcome, Task, TaskKind, WorkKey,
};
use tokio::sync::broadcast;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn snapshot(document_id: i64, version: u64) -> DocumentSnapshot {
    DocumentSnapshot::new(
        1,
        document_id,
        format!("doc-{document_id}"),
        version,
        format!("text v{version}"),
    )
}

fn index(indexer: &RecordingIndexer, document_id: i64, version: u64) -> IndexDocumentTask {
    IndexDocumentTask::new(snapshot(document_id, version), Arc::new(indexer.clone()))
}

fn start(workers: usize) -> Scheduler {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Scheduler::start(SchedulerConfig::default().with_workers(workers)).expect("valid config")
}

/// Wait for the first event matching `pred`.
async fn wait_for<F>(events: &mut broadcast::Receiver<SchedulerEvent>, pred: F) -> SchedulerEvent
where
    F: Fn(&SchedulerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

/// Task that panics when run.
struct PanicTask(WorkKey);

#[async_trait]
impl Task for PanicTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Custom("panic")
    }

    fn work_key(&self) -> &WorkKey {
        &self.0
    }

    async fn run(&self) -> Result<()> {
        panic!("recommender crashed");
    }
}

/// Task that outlives its timeout.
struct SlowTask(WorkKey);

#[async_trait]
impl Task for SlowTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Custom("slow")
    }

    fn work_key(&self) -> &WorkKey {
        &self.0
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::Never
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(20))
    }

    async fn run(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

// ============================================================================
// COALESCING
// ============================================================================

#[tokio::test]
async fn test_matching_submissions_run_once_with_latest_snapshot() {
    let scheduler = start(4);
    let indexer = RecordingIndexer::new();
    scheduler.pause();

    let first = scheduler.submit(index(&indexer, 7, 1));
    let second = scheduler.submit(index(&indexer, 7, 2));
    let third = scheduler.submit(index(&indexer, 7, 3));

    assert!(matches!(first, SubmitOutcome::Queued { .. }));
    assert!(matches!(second, SubmitOutcome::Replaced { replaced, .. } if Some(replaced) == first.task_id()));
    assert!(matches!(third, SubmitOutcome::Replaced { replaced, .. } if Some(replaced) == second.task_id()));
    assert_eq!(scheduler.pending(), 1);

    scheduler.resume();
    scheduler.shutdown_and_flush().await;

    assert_eq!(indexer.indexed_versions("doc-7"), vec![3]);
    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.replaced, 2);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_non_matching_submissions_all_run() {
    let scheduler = start(4);
    let indexer = RecordingIndexer::new();
    scheduler.pause();

    scheduler.submit(index(&indexer, 7, 1));
    scheduler.submit(index(&indexer, 8, 1));
    scheduler.submit(ReindexProjectTask::new(1, Arc::new(indexer.clone())));
    assert_eq!(scheduler.pending(), 3);

    scheduler.resume();
    scheduler.shutdown_and_flush().await;

    assert_eq!(indexer.indexed_versions("doc-7"), vec![1]);
    assert_eq!(indexer.indexed_versions("doc-8"), vec![1]);
    assert_eq!(indexer.get_calls().len(), 3);
}

#[tokio::test]
async fn test_replacement_keeps_queue_position() {
    let scheduler = start(1);
    let indexer = RecordingIndexer::new();
    scheduler.pause();

    scheduler.submit(index(&indexer, 7, 1));
    scheduler.submit(index(&indexer, 8, 1));
    scheduler.submit(index(&indexer, 7, 2));

    scheduler.resume();
    scheduler.shutdown_and_flush().await;

    let order: Vec<(Option<String>, Option<u64>)> = indexer
        .get_calls()
        .into_iter()
        .map(|c| (c.document, c.version))
        .collect();
    assert_eq!(
        order,
        vec![
            (Some("doc-7".to_string()), Some(2)),
            (Some("doc-8".to_string()), Some(1)),
        ]
    );
}

#[tokio::test]
async fn test_running_task_is_not_replaced() {
    let scheduler = start(2);
    let indexer = RecordingIndexer::new().with_latency(Duration::from_millis(100));
    let mut events = scheduler.events();

    scheduler.submit(index(&indexer, 7, 1));
    wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskStarted { .. })).await;

    let outcome = scheduler.submit(index(&indexer, 7, 2));
    assert!(matches!(outcome, SubmitOutcome::Queued { .. }));

    scheduler.shutdown_and_flush().await;
    assert_eq!(indexer.indexed_versions("doc-7"), vec![1, 2]);
}

#[tokio::test]
async fn test_replacement_emits_event() {
    let scheduler = start(2);
    let indexer = RecordingIndexer::new();
    let mut events = scheduler.events();
    scheduler.pause();

    let first = scheduler.submit(index(&indexer, 7, 1)).task_id();
    let second = scheduler.submit(index(&indexer, 7, 2)).task_id();

    let event = wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskReplaced { .. })).await;
    match event {
        SchedulerEvent::TaskReplaced {
            task_id,
            replaced_by,
            kind,
        } => {
            assert_eq!(Some(task_id), first);
            assert_eq!(Some(replaced_by), second);
            assert_eq!(kind, TaskKind::IndexDocument);
        }
        other => panic!("unexpected event {other:?}"),
    }

    scheduler.shutdown().await;
}

/// Submit 20 versions of doc 7, each followed by one unrelated document
/// until 10 of them are in.
fn submit_interleaved(scheduler: &Scheduler, indexer: &RecordingIndexer) {
    for version in 1..=20u64 {
        scheduler.submit(index(indexer, 7, version));
        if version <= 10 {
            scheduler.submit(index(indexer, 100 + version as i64, 1));
        }
    }
}

#[tokio::test]
async fn test_resubmitted_key_does_not_starve_others() {
    for workers in [1, 4] {
        let scheduler = start(workers);
        let indexer = RecordingIndexer::new();
        scheduler.pause();

        submit_interleaved(&scheduler, &indexer);
        assert_eq!(scheduler.pending(), 11);

        scheduler.resume();
        scheduler.shutdown_and_flush().await;

        for document in 101..=110 {
            assert_eq!(
                indexer.indexed_versions(&format!("doc-{document}")),
                vec![1],
                "doc-{document} with {workers} workers"
            );
        }
        assert_eq!(indexer.indexed_versions("doc-7"), vec![20], "{workers} workers");
    }
}

#[tokio::test]
async fn test_resubmitted_key_does_not_starve_others_while_running() {
    for workers in [1, 4] {
        let scheduler = start(workers);
        let indexer = RecordingIndexer::new().with_latency(Duration::from_millis(2));

        submit_interleaved(&scheduler, &indexer);
        scheduler.shutdown_and_flush().await;

        for document in 101..=110 {
            assert_eq!(indexer.indexed_versions(&format!("doc-{document}")), vec![1]);
        }
        let doc7 = indexer.indexed_versions("doc-7");
        assert_eq!(doc7.last(), Some(&20), "{workers} workers");
        assert!(doc7.windows(2).all(|w| w[0] < w[1]));
    }
}

// ============================================================================
// FAILURE ISOLATION
// ============================================================================

#[tokio::test]
async fn test_failed_task_does_not_stop_others() {
    let scheduler = start(1);
    let failing = RecordingIndexer::new().failing();
    let healthy = RecordingIndexer::new();
    let mut events = scheduler.events();
    scheduler.pause();

    scheduler.submit(index(&failing, 7, 1));
    scheduler.submit(index(&healthy, 8, 1));
    scheduler.resume();

    let failed = wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskFailed { .. })).await;
    assert!(matches!(failed, SchedulerEvent::TaskFailed { ref error, .. } if error.contains("index unavailable")));

    scheduler.shutdown_and_flush().await;
    assert_eq!(healthy.indexed_versions("doc-8"), vec![1]);
    let stats = scheduler.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_panicking_task_does_not_kill_lane() {
    let scheduler = start(1);
    let indexer = RecordingIndexer::new();
    let mut events = scheduler.events();
    scheduler.pause();

    scheduler.submit(PanicTask(WorkKey::project(1)));
    scheduler.submit(index(&indexer, 7, 1));
    scheduler.resume();

    let failed = wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskFailed { .. })).await;
    assert!(matches!(failed, SchedulerEvent::TaskFailed { ref error, .. } if error.contains("recommender crashed")));

    scheduler.shutdown_and_flush().await;
    assert_eq!(indexer.indexed_versions("doc-7"), vec![1]);
}

#[tokio::test]
async fn test_timeout_fails_task() {
    let scheduler = start(1);
    let mut events = scheduler.events();

    scheduler.submit(SlowTask(WorkKey::project(1)));

    let failed = wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskFailed { .. })).await;
    assert!(matches!(failed, SchedulerEvent::TaskFailed { ref error, .. } if error.contains("timeout")));

    scheduler.shutdown().await;
    assert_eq!(scheduler.stats().failed, 1);
}

// ============================================================================
// CAPACITY & LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_full_queue_evicts_oldest() {
    let scheduler =
        Scheduler::start(SchedulerConfig::default().with_workers(2).with_capacity(2)).unwrap();
    let indexer = RecordingIndexer::new();
    scheduler.pause();

    let oldest = scheduler.submit(index(&indexer, 1, 1)).task_id();
    scheduler.submit(index(&indexer, 2, 1));
    let outcome = scheduler.submit(index(&indexer, 3, 1));

    assert!(matches!(outcome, SubmitOutcome::QueuedEvictedOldest { evicted, .. } if Some(evicted) == oldest));
    assert_eq!(scheduler.pending(), 2);

    scheduler.resume();
    scheduler.shutdown_and_flush().await;

    assert!(indexer.indexed_versions("doc-1").is_empty());
    assert_eq!(scheduler.stats().evicted, 1);
}

#[tokio::test]
async fn test_eviction_reports_evicted_task_kind() {
    let scheduler =
        Scheduler::start(SchedulerConfig::default().with_workers(1).with_capacity(1)).unwrap();
    let indexer = RecordingIndexer::new();
    let mut events = scheduler.events();
    scheduler.pause();

    let oldest = scheduler.submit(index(&indexer, 1, 1)).task_id();
    let outcome = scheduler.submit(ReindexProjectTask::new(1, Arc::new(indexer.clone())));
    assert!(matches!(outcome, SubmitOutcome::QueuedEvictedOldest { .. }));

    let evicted = wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskEvicted { .. })).await;
    match evicted {
        SchedulerEvent::TaskEvicted { task_id, kind } => {
            assert_eq!(Some(task_id), oldest);
            assert_eq!(kind, TaskKind::IndexDocument);
        }
        other => panic!("unexpected event {other:?}"),
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drops_queued_tasks() {
    let scheduler = start(2);
    let indexer = RecordingIndexer::new();
    let mut events = scheduler.events();
    scheduler.pause();

    for document in 0..3 {
        scheduler.submit(index(&indexer, document, 1));
    }
    scheduler.shutdown().await;

    wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskDropped { .. })).await;
    assert!(indexer.get_calls().is_empty());
    let stats = scheduler.stats();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let scheduler = start(1);
    let indexer = RecordingIndexer::new();
    scheduler.shutdown().await;

    let outcome = scheduler.submit(index(&indexer, 7, 1));
    assert_eq!(outcome, SubmitOutcome::Rejected);
    assert_eq!(scheduler.stats().rejected, 1);

    // A second shutdown is a no-op.
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_and_flush_ignores_pause() {
    let scheduler = start(2);
    let indexer = RecordingIndexer::new();
    scheduler.pause();

    scheduler.submit(index(&indexer, 7, 1));
    scheduler.submit(index(&indexer, 8, 1));
    scheduler.shutdown_and_flush().await;

    assert_eq!(indexer.get_calls().len(), 2);
    assert_eq!(scheduler.stats().completed, 2);
}

#[test]
fn test_invalid_config_is_rejected() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let result = Scheduler::start(SchedulerConfig::default().with_workers(0));
        assert!(matches!(result, Err(Error::Config(_))));
    });
}

#[tokio::test]
async fn test_indexer_trait_object_is_accepted() {
    let scheduler = start(1);
    let indexer = RecordingIndexer::new();
    let shared: Arc<dyn Indexer> = Arc::new(indexer.clone());

    scheduler.submit_shared(Arc::new(IndexDocumentTask::new(snapshot(9, 4), shared)));
    scheduler.shutdown_and_flush().await;

    assert_eq!(indexer.indexed_versions("doc-9"), vec![4]);
}

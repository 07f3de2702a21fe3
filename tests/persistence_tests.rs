
use async_trait::async_trait;
use batchwork::{
    BatchScheduler, FileSnapshotStore, JobDefinition, JobStatus, MemorySnapshotStore,
    RuntimeJob, SnapshotStore, TimeWindow,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tempfile::tempdir;
use test_utils::{fast_config, wait_for};

fn record(id: &str, status: JobStatus) -> RuntimeJob {
    let mut job = RuntimeJob::new(JobDefinition::new(id), Utc::now());
    job.status = status;
    job
}

/// A memory store whose loads take a while.
struct SlowLoadStore {
    inner: MemorySnapshotStore,
    delay: Duration,
}

#[async_trait]
impl SnapshotStore for SlowLoadStore {
    async fn save(&self, jobs: &[RuntimeJob]) -> batchwork::Result<()> {
        self.inner.save(jobs).await
    }

    async fn load(&self) -> Vec<RuntimeJob> {
        tokio::time::sleep(self.delay).await;
        self.inner.load().await
    }
}

/// Unfinished jobs come back queued; terminal ones are kept as they were
#[tokio::test]
async fn test_recovery_requeues_unfinished_jobs() {
    let store = Arc::new(MemorySnapshotStore::new());

    let mut inflight = record("inflight", JobStatus::Running);
    inflight.attempts = 1;
    inflight.started_at = Some(Utc::now());
    let mut backing_off = record("backing-off", JobStatus::Queued);
    backing_off.attempts = 2;
    backing_off.next_eligible_at = Some(Utc::now() + chrono::Duration::hours(1));
    let mut done = record("done", JobStatus::Succeeded);
    done.attempts = 1;
    let mut gave_up = record("gave-up", JobStatus::Failed);
    gave_up.failure_reason = Some("disk full".to_string());

    store
        .save(&[
            record("paused", JobStatus::Held),
            inflight,
            backing_off,
            record("waiting-on-parent", JobStatus::Blocked),
            done,
            gave_up,
            record("dropped", JobStatus::Cancelled),
        ])
        .await
        .unwrap();

    // Long tick so nothing is dispatched before the table is inspected.
    let scheduler = BatchScheduler::builder(fast_config().with_tick_interval(Duration::from_secs(3600)))
        .with_snapshot_store(store.clone())
        .build()
        .unwrap();
    scheduler.wait_until_recovered().await;
    assert!(scheduler.is_recovered());

    let snapshot = scheduler.snapshot();
    assert_eq!(
        snapshot.ids(JobStatus::Queued),
        vec!["paused", "inflight", "backing-off", "waiting-on-parent"]
    );
    assert!(snapshot.held.is_empty());
    assert!(snapshot.running.is_empty());
    assert_eq!(snapshot.ids(JobStatus::Succeeded), vec!["done"]);
    assert_eq!(snapshot.ids(JobStatus::Failed), vec!["gave-up"]);
    assert_eq!(snapshot.ids(JobStatus::Cancelled), vec!["dropped"]);

    let inflight = scheduler.get("inflight").unwrap();
    assert_eq!(inflight.attempts, 1);
    let backing_off = scheduler.get("backing-off").unwrap();
    assert_eq!(backing_off.attempts, 2);
    assert_eq!(backing_off.next_eligible_at, None);
    assert_eq!(
        scheduler.get("gave-up").unwrap().failure_reason.as_deref(),
        Some("disk full")
    );

    // Recovered jobs run on the next cycle.
    let mut started = scheduler.tick_once().started;
    started.sort();
    assert_eq!(
        started,
        vec!["backing-off", "inflight", "paused", "waiting-on-parent"]
    );
    assert!(scheduler.wait_for_idle(Duration::from_secs(5)).await);
}

/// A held job persisted by one scheduler is queued in the next
#[tokio::test]
async fn test_round_trip_through_shutdown() {
    let store = Arc::new(MemorySnapshotStore::new());

    let first = BatchScheduler::builder(fast_config())
        .with_snapshot_store(store.clone())
        .build()
        .unwrap();
    first.wait_until_recovered().await;

    first.submit(JobDefinition::new("finished")).unwrap();
    first
        .submit(JobDefinition::new("parked").with_time_window(TimeWindow::starting_at(
            Utc::now() + chrono::Duration::hours(1),
        )))
        .unwrap();
    first.hold("parked").unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || {
            first.get("finished").map(|job| job.status) == Some(JobStatus::Succeeded)
        })
        .await
    );
    first.shutdown().await.unwrap();
    drop(first);

    let second = BatchScheduler::builder(fast_config().with_tick_interval(Duration::from_secs(3600)))
        .with_snapshot_store(store.clone())
        .build()
        .unwrap();
    second.wait_until_recovered().await;

    let parked = second.get("parked").unwrap();
    assert_eq!(parked.status, JobStatus::Queued);
    assert!(parked.definition.time_window.is_some());
    assert_eq!(
        second.get("finished").unwrap().status,
        JobStatus::Succeeded
    );

    // The window is still closed, so the next cycle blocks it again.
    let result = second.tick_once();
    assert_eq!(result.blocked, vec!["parked"]);
}

#[tokio::test]
async fn test_changes_are_persisted_in_the_background() {
    let store = Arc::new(MemorySnapshotStore::new());
    let scheduler = BatchScheduler::builder(fast_config())
        .with_snapshot_store(store.clone())
        .build()
        .unwrap();
    scheduler.wait_until_recovered().await;

    scheduler.submit(JobDefinition::new("tracked")).unwrap();
    assert!(scheduler.wait_for_idle(Duration::from_secs(5)).await);

    let mut persisted_success = false;
    for _ in 0..100 {
        let stored = store.load().await;
        if stored
            .iter()
            .any(|job| job.id() == "tracked" && job.status == JobStatus::Succeeded)
        {
            persisted_success = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(persisted_success);
    assert!(store.save_count() >= 1);
}

#[tokio::test]
async fn test_live_submission_wins_over_recovered_record() {
    let store = Arc::new(MemorySnapshotStore::new());
    let mut stale = record("report", JobStatus::Held);
    stale.definition.description = Some("from snapshot".to_string());
    store.save(&[stale, record("other", JobStatus::Queued)]).await.unwrap();

    let scheduler = BatchScheduler::builder(fast_config().with_tick_interval(Duration::from_secs(3600)))
        .with_snapshot_store(store.clone())
        .build()
        .unwrap();
    // Recovery runs on the runtime; nothing has been polled yet.
    scheduler
        .submit(JobDefinition::new("report").with_description("live"))
        .unwrap();
    scheduler.wait_until_recovered().await;

    let report = scheduler.get("report").unwrap();
    assert_eq!(report.definition.description.as_deref(), Some("live"));
    assert_eq!(scheduler.get("other").unwrap().status, JobStatus::Queued);
    assert_eq!(scheduler.snapshot().total(), 2);
}

/// Writes requested before the stored table is loaded must not replace it
#[tokio::test]
async fn test_submit_during_recovery_keeps_stored_records() {
    let store = Arc::new(SlowLoadStore {
        inner: MemorySnapshotStore::new(),
        delay: Duration::from_millis(50),
    });
    let mut audit = record("audit-record", JobStatus::Succeeded);
    audit.attempts = 1;
    store.inner.save(&[audit]).await.unwrap();

    let scheduler = BatchScheduler::builder(fast_config())
        .with_snapshot_store(store.clone())
        .build()
        .unwrap();
    scheduler.submit(JobDefinition::new("fresh")).unwrap();
    // An explicit write issued now has to wait for the load as well.
    scheduler.persist().await.unwrap();
    assert!(scheduler.is_recovered());

    let audit = scheduler.get("audit-record").unwrap();
    assert_eq!(audit.status, JobStatus::Succeeded);
    assert_eq!(audit.attempts, 1);
    assert!(scheduler.get("fresh").is_some());

    let stored: Vec<String> = store
        .inner
        .load()
        .await
        .iter()
        .map(|job| job.id().to_string())
        .collect();
    assert!(stored.contains(&"audit-record".to_string()));
    assert!(stored.contains(&"fresh".to_string()));

    assert!(scheduler.wait_for_idle(Duration::from_secs(5)).await);
    scheduler.shutdown().await.unwrap();
    let stored = store.inner.load().await;
    assert_eq!(stored.len(), 2);
    assert!(
        stored
            .iter()
            .any(|job| job.id() == "audit-record" && job.status == JobStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("jobs.json");

    let first = BatchScheduler::new(fast_config().with_snapshot_path(&path)).unwrap();
    first.wait_until_recovered().await;
    first.submit(JobDefinition::new("extract")).unwrap();
    first
        .submit(JobDefinition::new("load").depends_on("extract"))
        .unwrap();
    first.hold("load").unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || {
            first.get("extract").map(|job| job.status) == Some(JobStatus::Succeeded)
        })
        .await
    );
    first.persist().await.unwrap();
    first.shutdown().await.unwrap();
    drop(first);

    assert!(path.exists());
    let stored = FileSnapshotStore::new(&path).load().await;
    assert_eq!(stored.len(), 2);

    let second = BatchScheduler::new(
        fast_config()
            .with_snapshot_path(&path)
            .with_tick_interval(Duration::from_secs(3600)),
    )
    .unwrap();
    second.wait_until_recovered().await;
    assert_eq!(second.get("load").unwrap().status, JobStatus::Queued);
    assert_eq!(second.tick_once().started, vec!["load"]);
    assert!(second.wait_for_idle(Duration::from_secs(5)).await);
    assert_eq!(second.get("load").unwrap().status, JobStatus::Succeeded);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let scheduler = BatchScheduler::new(fast_config().with_snapshot_path(&path)).unwrap();
    scheduler.wait_until_recovered().await;
    assert_eq!(scheduler.snapshot().total(), 0);
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use recon_core::{ImportWindow, Page, Record, RunOutcome};
use recon_storage::{MemoryStore, RecordStore, StoreError};
use recon_sync::{
    open_store, ReconcileConfig, ReconcileError, ReconcileOptions, ReconcilePipeline, Reconciler,
};
use tokio_util::sync::CancellationToken;

fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).single().unwrap()
}

fn task(id: &str, title: &str, assignee: &str, created: DateTime<Utc>, deadline: Option<NaiveDate>) -> Record {
    Record {
        record_id: id.to_string(),
        title: title.to_string(),
        assignee_label: assignee.to_string(),
        status: "Todo".into(),
        deadline,
        description: String::new(),
        created_time: created,
        last_edited_time: created,
    }
}

/// Archive calls take a while, so overlapping runs see each other in flight.
struct SlowArchiveStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl RecordStore for SlowArchiveStore {
    fn store_id(&self) -> &str {
        self.inner.store_id()
    }

    async fn query(&self, cursor: Option<&str>) -> Result<Page, StoreError> {
        self.inner.query(cursor).await
    }

    async fn archive(&self, record_id: &str) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.archive(record_id).await
    }
}

/// Trips the run's cancellation token from inside the first archive call.
struct CancelOnArchiveStore {
    inner: Arc<MemoryStore>,
    cancel: CancellationToken,
}

#[async_trait]
impl RecordStore for CancelOnArchiveStore {
    fn store_id(&self) -> &str {
        self.inner.store_id()
    }

    async fn query(&self, cursor: Option<&str>) -> Result<Page, StoreError> {
        self.inner.query(cursor).await
    }

    async fn archive(&self, record_id: &str) -> Result<(), StoreError> {
        let result = self.inner.archive(record_id).await;
        self.cancel.cancel();
        result
    }
}

fn drifted_board() -> Vec<Record> {
    vec![
        task("a1", "Renew vendor contract", "ana", ts(2025, 8, 19), NaiveDate::from_ymd_opt(2025, 9, 2)),
        task("a2", "renew vendor contract ", "ana", ts(2025, 8, 1), NaiveDate::from_ymd_opt(2025, 9, 9)),
        task("b1", "Publish changelog", "bo", ts(2025, 8, 2), None),
        task("b2", "Publish changelog", "bo", ts(2025, 8, 3), None),
        task("b3", "Publish changelog", "bo", ts(2025, 8, 4), None),
        task("c1", "Publish changelog", "cy", ts(2025, 8, 4), None),
        task("e1", "", "ana", ts(2025, 8, 4), None),
        task("e2", "", "ana", ts(2025, 8, 4), None),
    ]
}

fn options() -> ReconcileOptions {
    ReconcileOptions {
        import_window: ImportWindow::new(ts(2025, 8, 18), ts(2025, 8, 20)),
        ..ReconcileOptions::default()
    }
}

#[tokio::test]
async fn reconcile_retires_losers_and_is_idempotent() {
    let store = Arc::new(MemoryStore::new("board", drifted_board()).with_page_size(3));
    let reconciler = Reconciler::new(store.clone());
    let cancel = CancellationToken::new();

    let first = reconciler.reconcile(&options(), &cancel).await.expect("first run");
    assert_eq!(first.total_records_scanned, 8);
    assert_eq!(first.groups_with_duplicates, 2);
    assert_eq!(first.records_retired, 3);
    assert_eq!(first.records_failed, 0);
    assert_eq!(first.outcome(), RunOutcome::Reconciled);
    assert!(first.decisions.is_empty());

    assert!(store.is_archived("a2").await);
    assert!(!store.is_archived("a1").await);
    // no deadlines on either side: the latest edit survives
    assert!(store.is_archived("b1").await);
    assert!(store.is_archived("b2").await);
    assert!(!store.is_archived("b3").await);
    assert!(!store.is_archived("e1").await);
    assert!(!store.is_archived("e2").await);

    let second = reconciler.reconcile(&options(), &cancel).await.expect("second run");
    assert_eq!(second.total_records_scanned, 5);
    assert_eq!(second.groups_with_duplicates, 0);
    assert_eq!(second.outcome(), RunOutcome::NoDuplicates);
    assert_eq!(store.archive_calls().await, 3);
}

#[tokio::test]
async fn one_failed_archive_does_not_stop_the_batch() {
    let records = vec![
        task("x1", "Rotate keys", "ops", ts(2025, 7, 1), None),
        task("x2", "Rotate keys", "ops", ts(2025, 7, 2), None),
        task("x3", "Rotate keys", "ops", ts(2025, 7, 3), None),
    ];
    let store = Arc::new(MemoryStore::new("board", records).with_archive_failure("x1", "rate limited"));
    let report = Reconciler::new(store.clone())
        .reconcile(&ReconcileOptions::default(), &CancellationToken::new())
        .await
        .expect("run completes");

    assert_eq!(report.groups_with_duplicates, 1);
    assert_eq!(report.records_retired, 1);
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.failures[0].record_id, "x1");
    assert!(store.is_archived("x2").await);
    assert!(!store.is_archived("x3").await);
    assert!(report.failures[0].reason.contains("rate limited"));
    assert_eq!(report.outcome(), RunOutcome::PartialFailure);
}

#[tokio::test]
async fn dry_run_reports_decisions_without_archiving() {
    let records = vec![
        task("d1", "Book venue", "ana", ts(2025, 7, 1), NaiveDate::from_ymd_opt(2025, 9, 1)),
        task("d2", "Book venue", "ana", ts(2025, 7, 2), NaiveDate::from_ymd_opt(2025, 9, 3)),
    ];
    let store = Arc::new(MemoryStore::new("board", records));
    let report = Reconciler::new(store.clone())
        .reconcile(
            &ReconcileOptions {
                dry_run: true,
                ..ReconcileOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("dry run");

    assert_eq!(report.outcome(), RunOutcome::DryRun);
    assert_eq!(report.decisions.len(), 1);
    assert_eq!(report.decisions[0].survivor_id, "d2");
    assert_eq!(report.decisions[0].retire_ids, vec!["d1"]);
    assert_eq!(report.records_retired, 0);
    assert_eq!(store.archive_calls().await, 0);
}

#[tokio::test]
async fn empty_store_is_an_all_zero_report() {
    let store = Arc::new(MemoryStore::new("board", Vec::new()));
    let report = Reconciler::new(store)
        .reconcile(&ReconcileOptions::default(), &CancellationToken::new())
        .await
        .expect("empty run");
    assert_eq!(report.total_records_scanned, 0);
    assert_eq!(report.groups_with_duplicates, 0);
    assert_eq!(report.outcome(), RunOutcome::NoDuplicates);
}

#[tokio::test]
async fn unavailable_source_fails_before_any_archive() {
    let store = Arc::new(MemoryStore::new("board", drifted_board()).with_query_failure("timeout"));
    let err = Reconciler::new(store.clone())
        .reconcile(&options(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::SourceUnavailable(_)));
    assert_eq!(store.archive_calls().await, 0);
}

#[tokio::test]
async fn cancel_before_retirement_leaves_store_untouched() {
    let store = Arc::new(MemoryStore::new("board", drifted_board()));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = Reconciler::new(store.clone())
        .reconcile(&options(), &cancel)
        .await
        .expect("cancelled run");
    assert!(report.cancelled);
    assert_eq!(report.total_records_scanned, 0);
    assert_eq!(report.groups_with_duplicates, 0);
    assert_eq!(report.records_retired, 0);
    assert_eq!(report.outcome(), RunOutcome::Cancelled);
    assert_eq!(store.archive_calls().await, 0);
}

#[tokio::test]
async fn fixture_pipeline_writes_a_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = serde_json::json!({
        "store_id": "ops-board",
        "records": drifted_board(),
    });
    std::fs::write(dir.path().join("tasks.json"), fixture.to_string()).unwrap();

    let mut config = ReconcileConfig::from_env();
    config.store = "fixture".into();
    config.fixture_path = "tasks.json".into();
    config.workspace_root = dir.path().to_path_buf();

    let store = open_store(&config).await.expect("fixture store");
    let pipeline = ReconcilePipeline::with_store(config, store);
    let summary = pipeline
        .run_once(&options(), &CancellationToken::new(), true)
        .await
        .expect("pipeline run");

    assert_eq!(summary.report.records_retired, 3);
    let report_dir = summary.report_dir.expect("report dir");
    assert!(report_dir.join("reconciliation.json").exists());
    assert!(report_dir.join("summary.md").exists());
    assert!(report_dir.starts_with(dir.path().join("reports")));
}

#[tokio::test]
async fn overlapping_runs_archive_each_record_once() {
    let memory = Arc::new(MemoryStore::new(
        "board",
        vec![
            task("k1", "File taxes", "ana", ts(2025, 7, 1), None),
            task("k2", "File taxes", "ana", ts(2025, 7, 2), None),
        ],
    ));
    let store = Arc::new(SlowArchiveStore {
        inner: memory.clone(),
        delay: Duration::from_millis(50),
    });
    let reconciler = Reconciler::new(store);
    let options = ReconcileOptions::default();
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        reconciler.reconcile(&options, &cancel),
        reconciler.reconcile(&options, &cancel)
    );
    let (first, second) = (first.expect("first run"), second.expect("second run"));

    assert_eq!(memory.archive_calls().await, 1);
    assert_eq!(first.records_retired + second.records_retired, 1);
    assert_eq!(first.records_failed + second.records_failed, 0);
    assert!(memory.is_archived("k1").await);
    assert!(!memory.is_archived("k2").await);
}

#[tokio::test]
async fn cancel_mid_batch_reports_only_completed_calls() {
    let memory = Arc::new(MemoryStore::new(
        "board",
        vec![
            task("y1", "Order badges", "bo", ts(2025, 7, 1), None),
            task("y2", "Order badges", "bo", ts(2025, 7, 2), None),
            task("y3", "Order badges", "bo", ts(2025, 7, 3), None),
        ],
    ));
    let cancel = CancellationToken::new();
    let store = Arc::new(CancelOnArchiveStore {
        inner: memory.clone(),
        cancel: cancel.clone(),
    });
    let options = ReconcileOptions {
        archive_concurrency: 1,
        ..ReconcileOptions::default()
    };

    let report = Reconciler::new(store)
        .reconcile(&options, &cancel)
        .await
        .expect("cancelled run");

    assert!(report.cancelled);
    assert_eq!(report.outcome(), RunOutcome::Cancelled);
    assert_eq!(report.total_records_scanned, 3);
    assert_eq!(report.groups_with_duplicates, 1);
    assert_eq!(report.records_retired, 1);
    assert_eq!(report.records_failed, 0);
    assert_eq!(memory.archive_calls().await, 1);
    assert!(!memory.is_archived("y3").await);
}

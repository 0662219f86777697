use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use scan_common::dead_letter::{
    DeadLetterMetadata, DeadLetterPublisher, PublishError, RejectReason,
};
use scan_common::health::HealthRegistry;
use scan_common::normalize::Normalizer;
use scan_common::pgqueue::PgQueue;
use scan_common::record::NormalizedRecord;
use scan_common::repository::{PgScanRepository, ScanRepository, StorageError};
use scan_common::retry::RetryPolicy;
use scan_processor::error::WorkerError;
use scan_processor::handler::ScanHandler;
use scan_processor::worker::{ScanWorker, WorkerSettings};
use serde_json::json;
use sqlx::PgPool;

#[derive(Default)]
struct RecordingDeadLetter {
    published: Mutex<Vec<DeadLetterMetadata>>,
}

#[async_trait]
impl DeadLetterPublisher for RecordingDeadLetter {
    async fn publish(
        &self,
        _payload: &[u8],
        metadata: &DeadLetterMetadata,
    ) -> Result<(), PublishError> {
        self.published.lock().unwrap().push(metadata.clone());
        Ok(())
    }
}

struct UnavailableRepository;

#[async_trait]
impl ScanRepository for UnavailableRepository {
    async fn upsert_latest(&self, _record: &NormalizedRecord) -> Result<(), StorageError> {
        Err(StorageError::QueryError {
            command: "INSERT".to_owned(),
            error: sqlx::Error::PoolTimedOut,
        })
    }
}

/// Stores scans in PostgreSQL after a delay, tracking how many writes overlap and how many
/// messages are leased while they run.
struct SlowRepository {
    inner: PgScanRepository,
    db: PgPool,
    delay: time::Duration,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    peak_leased: AtomicI64,
    started: tokio::sync::Notify,
}

impl SlowRepository {
    fn new(db: PgPool, delay: time::Duration) -> Self {
        Self {
            inner: PgScanRepository::new(db.clone()),
            db,
            delay,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            peak_leased: AtomicI64::new(0),
            started: tokio::sync::Notify::new(),
        }
    }
}

#[async_trait]
impl ScanRepository for SlowRepository {
    async fn upsert_latest(&self, record: &NormalizedRecord) -> Result<(), StorageError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        self.started.notify_one();

        let leased: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scan_queue WHERE status = 'leased'")
                .fetch_one(&self.db)
                .await
                .unwrap();
        self.peak_leased.fetch_max(leased, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        let result = self.inner.upsert_latest(record).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        poll_interval: time::Duration::from_millis(10),
        dequeue_batch_size: 2,
        lease_duration: time::Duration::from_secs(60),
        worker_count: 2,
        max_outstanding: 4,
        shutdown_timeout: time::Duration::from_secs(5),
    }
}

fn scan(timestamp: i64, data_version: i64, data: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ip": "1.1.1.1",
        "port": 80,
        "service": "HTTP",
        "timestamp": timestamp,
        "data_version": data_version,
        "data": data,
    }))
    .unwrap()
}

/// Poll `query` until it returns zero rows, panicking after a few seconds.
async fn wait_until_none(db: &PgPool, query: &str) {
    for _ in 0..500 {
        let remaining: i64 = sqlx::query_scalar(query).fetch_one(db).await.unwrap();
        if remaining == 0 {
            return;
        }
        tokio::time::sleep(time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {query}");
}

#[sqlx::test(migrations = "../migrations")]
async fn test_worker_settles_every_delivery(db: PgPool) {
    let queue = PgQueue::new_from_pool("scan-sub", db.clone()).await;
    queue
        .enqueue(&scan(100, 2, json!({"response_str": "old"})))
        .await
        .unwrap();
    queue
        .enqueue(&scan(200, 1, json!({"response_bytes_utf8": "aGVsbG8gd29ybGQ="})))
        .await
        .unwrap();
    queue.enqueue(b"{not json").await.unwrap();
    queue
        .enqueue(&scan(300, 99, json!({"response_str": "ignored"})))
        .await
        .unwrap();
    queue
        .enqueue(&scan(50, 2, json!({"response_str": "older"})))
        .await
        .unwrap();

    let repository = PgScanRepository::new(db.clone());
    let dead_letter = Arc::new(RecordingDeadLetter::default());
    let handler = ScanHandler::new(
        Arc::new(repository.clone()),
        dead_letter.clone(),
        Normalizer::default(),
        time::Duration::from_secs(5),
    );

    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("worker", ::time::Duration::seconds(30));
    let worker = ScanWorker::new(
        "test-worker",
        queue,
        Arc::new(handler),
        RetryPolicy::default(),
        settings(),
        liveness,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(worker.run(async move {
        shutdown_rx.await.ok();
    }));

    wait_until_none(
        &db,
        "SELECT COUNT(*) FROM scan_queue WHERE status <> 'completed'",
    )
    .await;
    assert!(registry.get_status().healthy);

    shutdown_tx.send(()).unwrap();
    running
        .await
        .expect("worker panicked")
        .expect("worker failed");

    let stored = repository
        .get_latest("1.1.1.1", 80, "HTTP")
        .await
        .unwrap()
        .expect("scan was not stored");
    assert_eq!(stored.response, "hello world");
    assert_eq!(stored.timestamp.timestamp(), 200);

    let mut reasons: Vec<RejectReason> = dead_letter
        .published
        .lock()
        .unwrap()
        .iter()
        .map(|metadata| metadata.reason)
        .collect();
    reasons.sort_by_key(|reason| reason.as_str());
    assert_eq!(
        reasons,
        vec![RejectReason::NormalizeError, RejectReason::ParseError]
    );
}

#[sqlx::test(migrations = "../migrations")]
async fn test_worker_nacks_on_storage_failure(db: PgPool) {
    let queue = PgQueue::new_from_pool("scan-sub", db.clone()).await;
    let id = queue
        .enqueue(&scan(100, 2, json!({"response_str": "ok"})))
        .await
        .unwrap();

    let dead_letter = Arc::new(RecordingDeadLetter::default());
    let handler = ScanHandler::new(
        Arc::new(UnavailableRepository),
        dead_letter.clone(),
        Normalizer::default(),
        time::Duration::from_secs(5),
    );
    // Far enough in the future for the message not to come back during the test.
    let retry_policy = RetryPolicy::new(
        2,
        time::Duration::from_secs(3600),
        time::Duration::from_secs(3600),
    );

    let registry = HealthRegistry::new("liveness");
    let worker = ScanWorker::new(
        "test-worker",
        queue,
        Arc::new(handler),
        retry_policy,
        settings(),
        registry.register("worker", ::time::Duration::seconds(30)),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(worker.run(async move {
        shutdown_rx.await.ok();
    }));

    wait_until_none(
        &db,
        "SELECT COUNT(*) FROM scan_queue WHERE NOT (status = 'available' AND attempt = 1)",
    )
    .await;

    shutdown_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    let scheduled_in_future: bool = sqlx::query_scalar(
        "SELECT scheduled_at > NOW() + INTERVAL '30 minutes' FROM scan_queue WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&db)
    .await
    .unwrap();
    assert!(scheduled_in_future);
    assert!(dead_letter.published.lock().unwrap().is_empty());
}

#[sqlx::test(migrations = "../migrations")]
async fn test_worker_stops_when_queue_is_unavailable(db: PgPool) {
    let queue = PgQueue::new_from_pool("scan-sub", db.clone()).await;
    let handler = ScanHandler::new(
        Arc::new(PgScanRepository::new(db.clone())),
        Arc::new(RecordingDeadLetter::default()),
        Normalizer::default(),
        time::Duration::from_secs(5),
    );
    let registry = HealthRegistry::new("liveness");
    let worker = ScanWorker::new(
        "test-worker",
        queue,
        Arc::new(handler),
        RetryPolicy::default(),
        settings(),
        registry.register("worker", ::time::Duration::seconds(30)),
    );

    db.close().await;

    let result = worker.run(std::future::pending::<()>()).await;
    assert!(matches!(result, Err(WorkerError::DatabaseError(_))));
}

#[sqlx::test(migrations = "../migrations")]
async fn test_worker_respects_concurrency_limits(db: PgPool) {
    let queue = PgQueue::new_from_pool("scan-sub", db.clone()).await;
    for port in 0..12 {
        let body = serde_json::to_vec(&json!({
            "ip": "1.1.1.1",
            "port": port,
            "service": "HTTP",
            "timestamp": 100,
            "data_version": 2,
            "data": {"response_str": "ok"},
        }))
        .unwrap();
        queue.enqueue(&body).await.unwrap();
    }

    let repository = Arc::new(SlowRepository::new(
        db.clone(),
        time::Duration::from_millis(100),
    ));
    let handler = ScanHandler::new(
        repository.clone(),
        Arc::new(RecordingDeadLetter::default()),
        Normalizer::default(),
        time::Duration::from_secs(5),
    );
    let registry = HealthRegistry::new("liveness");
    let worker = ScanWorker::new(
        "test-worker",
        queue,
        Arc::new(handler),
        RetryPolicy::default(),
        WorkerSettings {
            dequeue_batch_size: 10,
            worker_count: 3,
            max_outstanding: 5,
            ..settings()
        },
        registry.register("worker", ::time::Duration::seconds(30)),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(worker.run(async move {
        shutdown_rx.await.ok();
    }));

    wait_until_none(
        &db,
        "SELECT COUNT(*) FROM scan_queue WHERE status <> 'completed'",
    )
    .await;
    shutdown_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(repository.peak_active.load(Ordering::SeqCst), 3);
    assert_eq!(repository.peak_leased.load(Ordering::SeqCst), 5);

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(stored, 12);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_shutdown_waits_for_in_flight_scans(db: PgPool) {
    let queue = PgQueue::new_from_pool("scan-sub", db.clone()).await;
    let id = queue
        .enqueue(&scan(100, 2, json!({"response_str": "slow"})))
        .await
        .unwrap();

    let repository = Arc::new(SlowRepository::new(
        db.clone(),
        time::Duration::from_millis(500),
    ));
    let handler = ScanHandler::new(
        repository.clone(),
        Arc::new(RecordingDeadLetter::default()),
        Normalizer::default(),
        time::Duration::from_secs(5),
    );
    let registry = HealthRegistry::new("liveness");
    let worker = ScanWorker::new(
        "test-worker",
        queue,
        Arc::new(handler),
        RetryPolicy::default(),
        settings(),
        registry.register("worker", ::time::Duration::seconds(30)),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(worker.run(async move {
        shutdown_rx.await.ok();
    }));

    // Shut down while the only scan is still being written.
    repository.started.notified().await;
    shutdown_tx.send(()).unwrap();
    running.await.unwrap().unwrap();

    let status: String = sqlx::query_scalar("SELECT status::text FROM scan_queue WHERE id = $1")
        .bind(id)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(status, "completed");

    let stored = PgScanRepository::new(db)
        .get_latest("1.1.1.1", 80, "HTTP")
        .await
        .unwrap()
        .expect("in-flight scan was not stored");
    assert_eq!(stored.response, "slow");
}

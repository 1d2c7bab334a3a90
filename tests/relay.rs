//! End-to-end relay tests - ingestion, application, recovery, lifecycle

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncrelay::checkpoint::{CheckpointStore, SqliteCheckpoint};
use syncrelay::error::{RelayError, SourceError, StoreError};
use syncrelay::metrics::RelayMetrics;
use syncrelay::queue::{QueueSettings, SqliteQueue, WorkQueue};
use syncrelay::retry::RetryPolicy;
use syncrelay::source::{ChangeSource, EventStream, ResilientStream, SqliteChangeLog};
use syncrelay::store::{ProjectionStore, SqliteProjection};
use syncrelay::supervisor::{RelayState, Supervisor, SupervisorConfig};
use syncrelay::types::{
  ChangeEvent, ChangeOperation, Job, Position, ProjectedDocument, ResumeToken,
};
use syncrelay::worker::{WorkerPool, WorkerPoolConfig};

fn test_config() -> SupervisorConfig {
  SupervisorConfig {
    workers: WorkerPoolConfig {
      concurrency: 4,
      idle_poll: Duration::from_millis(10),
      io_timeout: Duration::from_secs(5),
    },
    enqueue_retry: RetryPolicy {
      max_attempts: 3,
      base_ms: 10,
      cap_ms: 40,
    },
    source_retry: RetryPolicy {
      max_attempts: 3,
      base_ms: 10,
      cap_ms: 40,
    },
    startup_retry: RetryPolicy {
      max_attempts: 3,
      base_ms: 10,
      cap_ms: 40,
    },
    drain_grace: Duration::from_secs(5),
  }
}

fn fast_queue_settings() -> QueueSettings {
  QueueSettings {
    retry: RetryPolicy {
      max_attempts: 3,
      base_ms: 10,
      cap_ms: 40,
    },
    lease_ms: 2000,
  }
}

async fn wait_for<F, Fut>(mut probe: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  for _ in 0..200 {
    if probe().await {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
  false
}

async fn wait_for_running(supervisor: &Supervisor) {
  let mut state = supervisor.watch_state();
  while *state.borrow() != RelayState::Running {
    state.changed().await.unwrap();
  }
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn relay_applies_source_mutations_to_projection() {
  let source = Arc::new(SqliteChangeLog::in_memory().await.unwrap());
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let checkpoint = Arc::new(SqliteCheckpoint::in_memory().await.unwrap());
  let store = Arc::new(SqliteProjection::in_memory().await.unwrap());

  let supervisor = Arc::new(Supervisor::new(
    source.clone(),
    queue.clone(),
    checkpoint.clone(),
    store.clone(),
    test_config(),
  ));
  let runner = {
    let supervisor = supervisor.clone();
    tokio::spawn(async move { supervisor.run().await })
  };
  wait_for_running(&supervisor).await;

  source
    .append(ChangeOperation::Insert, "7", Some(json!({"name": "A"})))
    .await
    .unwrap();
  source
    .append(ChangeOperation::Update, "7", Some(json!({"name": "B"})))
    .await
    .unwrap();
  let last = source
    .append(ChangeOperation::Insert, "8", Some(json!({"name": "C"})))
    .await
    .unwrap();

  let settled = wait_for(|| {
    let store = store.clone();
    async move {
      matches!(
        store.get("7").await,
        Ok(Some(ProjectedDocument { value, .. })) if value == json!({"name": "B"})
      ) && store.get("8").await.unwrap().is_some()
    }
  })
  .await;
  assert!(settled, "projection never converged");

  // The checkpoint only advances after a durable enqueue, so by now it
  // must have reached the last appended position.
  let settled = wait_for(|| {
    let checkpoint = checkpoint.clone();
    async move {
      checkpoint
        .load()
        .await
        .unwrap()
        .is_some_and(|t| t.position >= last)
    }
  })
  .await;
  assert!(settled, "checkpoint never reached {}", last);

  supervisor.shutdown();
  runner.await.unwrap().unwrap();
  assert_eq!(supervisor.state(), RelayState::Stopped);

  let metrics = supervisor.metrics();
  assert_eq!(metrics.events_ingested, 3);
  assert_eq!(metrics.jobs_enqueued, 3);
  assert_eq!(metrics.jobs_applied, 3);
  assert_eq!(metrics.dead_letters, 0);
}

#[tokio::test]
async fn delete_removes_projection_entry() {
  let source = Arc::new(SqliteChangeLog::in_memory().await.unwrap());
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let checkpoint = Arc::new(SqliteCheckpoint::in_memory().await.unwrap());
  let store = Arc::new(SqliteProjection::in_memory().await.unwrap());

  let supervisor = Arc::new(Supervisor::new(
    source.clone(),
    queue,
    checkpoint,
    store.clone(),
    test_config(),
  ));
  let runner = {
    let supervisor = supervisor.clone();
    tokio::spawn(async move { supervisor.run().await })
  };
  wait_for_running(&supervisor).await;

  source
    .append(ChangeOperation::Insert, "7", Some(json!({"name": "A"})))
    .await
    .unwrap();
  let settled = wait_for(|| {
    let store = store.clone();
    async move { store.get("7").await.unwrap().is_some() }
  })
  .await;
  assert!(settled);

  source
    .append(ChangeOperation::Delete, "7", None)
    .await
    .unwrap();
  let settled = wait_for(|| {
    let store = store.clone();
    async move { store.get("7").await.unwrap().is_none() }
  })
  .await;
  assert!(settled, "delete never reached the projection");

  supervisor.shutdown();
  runner.await.unwrap().unwrap();
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn restart_resumes_from_checkpoint_without_reingesting() {
  let dir = tempfile::tempdir().unwrap();
  let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
  let source_path = path("source.db");
  let queue_path = path("queue.db");
  let checkpoint_path = path("checkpoint.db");
  let store_path = path("store.db");

  let first_run_last;
  {
    let source = Arc::new(
      SqliteChangeLog::new(&source_path, Duration::from_millis(10), 100)
        .await
        .unwrap(),
    );
    let queue = Arc::new(
      SqliteQueue::new(&queue_path, fast_queue_settings())
        .await
        .unwrap(),
    );
    let checkpoint = Arc::new(SqliteCheckpoint::new(&checkpoint_path).await.unwrap());
    let store = Arc::new(SqliteProjection::new(&store_path).await.unwrap());

    let supervisor = Arc::new(Supervisor::new(
      source.clone(),
      queue,
      checkpoint,
      store.clone(),
      test_config(),
    ));
    let runner = {
      let supervisor = supervisor.clone();
      tokio::spawn(async move { supervisor.run().await })
    };
    wait_for_running(&supervisor).await;

    source
      .append(ChangeOperation::Insert, "a", Some(json!({"v": 1})))
      .await
      .unwrap();
    first_run_last = source
      .append(ChangeOperation::Insert, "b", Some(json!({"v": 2})))
      .await
      .unwrap();

    let settled = wait_for(|| {
      let store = store.clone();
      async move {
        store.get("a").await.unwrap().is_some() && store.get("b").await.unwrap().is_some()
      }
    })
    .await;
    assert!(settled);

    supervisor.shutdown();
    runner.await.unwrap().unwrap();
  }

  // "Restart": new instances over the same files. Events appended while
  // the relay was down must be picked up from the checkpoint, and nothing
  // from before it may be re-ingested.
  {
    let source = Arc::new(
      SqliteChangeLog::new(&source_path, Duration::from_millis(10), 100)
        .await
        .unwrap(),
    );
    source
      .append(ChangeOperation::Update, "a", Some(json!({"v": 3})))
      .await
      .unwrap();

    let queue = Arc::new(
      SqliteQueue::new(&queue_path, fast_queue_settings())
        .await
        .unwrap(),
    );
    let checkpoint = Arc::new(SqliteCheckpoint::new(&checkpoint_path).await.unwrap());
    let store = Arc::new(SqliteProjection::new(&store_path).await.unwrap());

    let token = checkpoint.load().await.unwrap().unwrap();
    assert!(token.position >= first_run_last);

    let supervisor = Arc::new(Supervisor::new(
      source.clone(),
      queue,
      checkpoint,
      store.clone(),
      test_config(),
    ));
    let runner = {
      let supervisor = supervisor.clone();
      tokio::spawn(async move { supervisor.run().await })
    };
    wait_for_running(&supervisor).await;

    let settled = wait_for(|| {
      let store = store.clone();
      async move {
        matches!(
          store.get("a").await,
          Ok(Some(ProjectedDocument { value, .. })) if value == json!({"v": 3})
        )
      }
    })
    .await;
    assert!(settled, "offline mutation never applied after restart");

    supervisor.shutdown();
    runner.await.unwrap().unwrap();

    // Only the offline event was ingested on the second run.
    assert_eq!(supervisor.metrics().events_ingested, 1);
    assert_eq!(store.get("b").await.unwrap().unwrap().value, json!({"v": 2}));
  }
}

#[tokio::test]
async fn restart_redelivers_jobs_enqueued_before_the_crash() {
  let dir = tempfile::tempdir().unwrap();
  let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
  let source_path = path("source.db");
  let queue_path = path("queue.db");
  let checkpoint_path = path("checkpoint.db");
  let store_path = path("store.db");

  // First life of the process: the dispatcher durably enqueued two jobs
  // and checkpointed past them, then died before any worker applied them.
  {
    let queue = SqliteQueue::new(&queue_path, fast_queue_settings())
      .await
      .unwrap();
    for (key, pos) in [("a", 1u64), ("b", 2u64)] {
      let job = Job::new(ChangeEvent {
        operation: ChangeOperation::Insert,
        document_key: key.to_string(),
        full_document: Some(json!({"v": pos})),
        position: Position(pos),
      });
      queue.enqueue(key, &job).await.unwrap();
    }
    let checkpoint = SqliteCheckpoint::new(&checkpoint_path).await.unwrap();
    checkpoint.save(ResumeToken::at(Position(2))).await.unwrap();
  }

  // Restart over the same files. The source feed is empty past the
  // checkpoint, so everything must come back out of the queue.
  let source = Arc::new(
    SqliteChangeLog::new(&source_path, Duration::from_millis(10), 100)
      .await
      .unwrap(),
  );
  let queue = Arc::new(
    SqliteQueue::new(&queue_path, fast_queue_settings())
      .await
      .unwrap(),
  );
  let checkpoint = Arc::new(SqliteCheckpoint::new(&checkpoint_path).await.unwrap());
  let store = Arc::new(SqliteProjection::new(&store_path).await.unwrap());

  let supervisor = Arc::new(Supervisor::new(
    source,
    queue.clone(),
    checkpoint,
    store.clone(),
    test_config(),
  ));
  let runner = {
    let supervisor = supervisor.clone();
    tokio::spawn(async move { supervisor.run().await })
  };
  wait_for_running(&supervisor).await;

  let settled = wait_for(|| {
    let store = store.clone();
    async move {
      store.get("a").await.unwrap().is_some() && store.get("b").await.unwrap().is_some()
    }
  })
  .await;
  assert!(settled, "pre-crash jobs never redelivered after restart");
  assert_eq!(queue.depth().await.unwrap(), 0);

  supervisor.shutdown();
  runner.await.unwrap().unwrap();

  let metrics = supervisor.metrics();
  assert_eq!(metrics.events_ingested, 0);
  assert_eq!(metrics.jobs_applied, 2);
  assert_eq!(store.get("b").await.unwrap().unwrap().value, json!({"v": 2}));
}

// =============================================================================
// Permanent failures
// =============================================================================

#[tokio::test]
async fn lost_resume_position_is_fatal() {
  let source = Arc::new(SqliteChangeLog::in_memory().await.unwrap());
  for i in 1..=5u64 {
    source
      .append(ChangeOperation::Insert, &i.to_string(), Some(json!({})))
      .await
      .unwrap();
  }
  source.prune_before(Position(5)).await.unwrap();

  // Direct subscribe with a pre-horizon token is the distinguishable
  // permanent failure.
  let err = source
    .subscribe(Some(ResumeToken::at(Position(2))))
    .await
    .unwrap_err();
  assert!(matches!(err, SourceError::ResumeLost(_)));

  // And through the supervisor it is fatal to the instance.
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let checkpoint = Arc::new(SqliteCheckpoint::in_memory().await.unwrap());
  checkpoint.save(ResumeToken::at(Position(2))).await.unwrap();
  let store = Arc::new(SqliteProjection::in_memory().await.unwrap());

  let supervisor = Supervisor::new(source, queue, checkpoint, store, test_config());
  let err = supervisor.run().await.unwrap_err();
  assert!(matches!(err, RelayError::ResumeLost(_)));
}

#[tokio::test]
async fn event_without_document_is_dead_lettered_not_retried_forever() {
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let store = Arc::new(SqliteProjection::in_memory().await.unwrap());
  let metrics = Arc::new(RelayMetrics::default());

  // An insert with no document can never apply.
  let bad = Job::new(ChangeEvent {
    operation: ChangeOperation::Insert,
    document_key: "7".to_string(),
    full_document: None,
    position: Position(1),
  });
  queue.enqueue("7", &bad).await.unwrap();

  let pool = WorkerPool::new(
    queue.clone(),
    store.clone(),
    metrics.clone(),
    WorkerPoolConfig {
      concurrency: 2,
      idle_poll: Duration::from_millis(10),
      io_timeout: Duration::from_secs(5),
    },
  );
  let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
  let mut workers = pool.spawn(&shutdown_tx);

  let settled = wait_for(|| {
    let queue = queue.clone();
    async move { queue.dead_letters().await.unwrap().len() == 1 }
  })
  .await;
  assert!(settled, "job never reached the dead-letter table");

  assert_eq!(queue.depth().await.unwrap(), 0);
  assert_eq!(metrics.snapshot().dead_letters, 1);
  let dead = queue.dead_letters().await.unwrap();
  assert_eq!(dead[0].attempts, 1);

  let _ = shutdown_tx.send(());
  while workers.join_next().await.is_some() {}
}

#[tokio::test]
async fn drain_leaves_unprocessed_jobs_unleased_and_uncharged() {
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let store = Arc::new(SqliteProjection::in_memory().await.unwrap());
  let metrics = Arc::new(RelayMetrics::default());

  for pos in 1..=5u64 {
    let job = Job::new(ChangeEvent {
      operation: ChangeOperation::Insert,
      document_key: pos.to_string(),
      full_document: Some(json!({"v": pos})),
      position: Position(pos),
    });
    queue.enqueue(&pos.to_string(), &job).await.unwrap();
  }

  let pool = WorkerPool::new(
    queue.clone(),
    store,
    metrics.clone(),
    WorkerPoolConfig {
      concurrency: 2,
      idle_poll: Duration::from_millis(10),
      io_timeout: Duration::from_secs(5),
    },
  );
  let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
  let mut workers = pool.spawn(&shutdown_tx);
  shutdown_tx.send(()).unwrap();
  while workers.join_next().await.is_some() {}

  // Whatever the pool did not finish must be reservable right away with
  // an untouched attempt budget: draining must never leave a job leased
  // or attempt-charged without having been processed.
  let applied = metrics.snapshot().jobs_applied;
  let mut remaining = 0u64;
  while let Some(lease) = queue.reserve().await.unwrap() {
    assert_eq!(lease.attempt, 1);
    remaining += 1;
  }
  assert_eq!(applied + remaining, 5);
  assert!(queue.dead_letters().await.unwrap().is_empty());
}

// =============================================================================
// Transient failures and ordering under redelivery
// =============================================================================

/// Projection store that fails its first N calls, then delegates.
struct FlakyStore {
  inner: SqliteProjection,
  remaining_failures: AtomicU32,
}

impl FlakyStore {
  fn trip(&self) -> Result<(), StoreError> {
    let left = self.remaining_failures.load(Ordering::SeqCst);
    if left > 0 {
      self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
      return Err(StoreError("injected outage".to_string()));
    }
    Ok(())
  }
}

#[async_trait]
impl ProjectionStore for FlakyStore {
  async fn conditional_upsert(
    &self,
    key: &str,
    value: &serde_json::Value,
    position: Position,
  ) -> Result<bool, StoreError> {
    self.trip()?;
    self.inner.conditional_upsert(key, value, position).await
  }

  async fn conditional_delete(
    &self,
    key: &str,
    min_position: Position,
  ) -> Result<bool, StoreError> {
    self.trip()?;
    self.inner.conditional_delete(key, min_position).await
  }

  async fn get(&self, key: &str) -> Result<Option<ProjectedDocument>, StoreError> {
    self.inner.get(key).await
  }
}

#[tokio::test]
async fn transient_store_outage_is_retried_until_applied() {
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let store = Arc::new(FlakyStore {
    inner: SqliteProjection::in_memory().await.unwrap(),
    remaining_failures: AtomicU32::new(2),
  });
  let metrics = Arc::new(RelayMetrics::default());

  let job = Job::new(ChangeEvent {
    operation: ChangeOperation::Insert,
    document_key: "k".to_string(),
    full_document: Some(json!({"v": 1})),
    position: Position(1),
  });
  queue.enqueue("k", &job).await.unwrap();

  let pool = WorkerPool::new(
    queue.clone(),
    store.clone(),
    metrics.clone(),
    WorkerPoolConfig {
      concurrency: 1,
      idle_poll: Duration::from_millis(10),
      io_timeout: Duration::from_secs(5),
    },
  );
  let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
  let mut workers = pool.spawn(&shutdown_tx);

  let settled = wait_for(|| {
    let store = store.clone();
    async move { store.get("k").await.unwrap().is_some() }
  })
  .await;
  assert!(settled, "job never applied after transient failures");

  let snapshot = metrics.snapshot();
  assert_eq!(snapshot.jobs_applied, 1);
  assert_eq!(snapshot.transient_retries, 2);
  assert_eq!(snapshot.dead_letters, 0);

  let _ = shutdown_tx.send(());
  while workers.join_next().await.is_some() {}
}

#[tokio::test]
async fn later_position_delivered_first_wins() {
  let queue = Arc::new(SqliteQueue::in_memory_with(fast_queue_settings()).await.unwrap());
  let store = Arc::new(SqliteProjection::in_memory().await.unwrap());
  let metrics = Arc::new(RelayMetrics::default());

  // Position 5 hits the queue before position 3 (retries can reorder
  // deliveries for the same key).
  for (pos, v) in [(5u64, 5), (3u64, 3)] {
    let job = Job::new(ChangeEvent {
      operation: ChangeOperation::Update,
      document_key: "k".to_string(),
      full_document: Some(json!({"v": v})),
      position: Position(pos),
    });
    queue.enqueue("k", &job).await.unwrap();
  }

  let pool = WorkerPool::new(
    queue.clone(),
    store.clone(),
    metrics.clone(),
    WorkerPoolConfig {
      concurrency: 1,
      idle_poll: Duration::from_millis(10),
      io_timeout: Duration::from_secs(5),
    },
  );
  let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
  let mut workers = pool.spawn(&shutdown_tx);

  let settled = wait_for(|| {
    let queue = queue.clone();
    async move { queue.depth().await.unwrap() == 0 }
  })
  .await;
  assert!(settled);

  let doc = store.get("k").await.unwrap().unwrap();
  assert_eq!(doc.value, json!({"v": 5}));
  assert_eq!(doc.last_applied_position, Position(5));
  assert_eq!(metrics.snapshot().stale_drops, 1);

  let _ = shutdown_tx.send(());
  while workers.join_next().await.is_some() {}
}

// =============================================================================
// Stream reconnection
// =============================================================================

/// Change source whose streams drop the connection once, then work.
struct InterruptedSource {
  inner: Arc<SqliteChangeLog>,
  tripped: Arc<AtomicBool>,
}

#[async_trait]
impl ChangeSource for InterruptedSource {
  async fn subscribe(
    &self,
    from: Option<ResumeToken>,
  ) -> Result<Box<dyn EventStream>, SourceError> {
    Ok(Box::new(InterruptedStream {
      inner: self.inner.subscribe(from).await?,
      tripped: self.tripped.clone(),
    }))
  }
}

struct InterruptedStream {
  inner: Box<dyn EventStream>,
  tripped: Arc<AtomicBool>,
}

#[async_trait]
impl EventStream for InterruptedStream {
  async fn next_event(&mut self) -> Result<ChangeEvent, SourceError> {
    if !self.tripped.swap(true, Ordering::SeqCst) {
      return Err(SourceError::Transient("connection reset".to_string()));
    }
    self.inner.next_event().await
  }

  fn position(&self) -> Position {
    self.inner.position()
  }
}

#[tokio::test]
async fn tail_subscription_reconnect_does_not_skip_events() {
  let log = Arc::new(SqliteChangeLog::in_memory().await.unwrap());
  log
    .append(ChangeOperation::Insert, "old", Some(json!({"v": 0})))
    .await
    .unwrap();

  let source = Arc::new(InterruptedSource {
    inner: log.clone(),
    tripped: Arc::new(AtomicBool::new(false)),
  });
  let mut stream = ResilientStream::open(
    source,
    None,
    RetryPolicy {
      max_attempts: 3,
      base_ms: 10,
      cap_ms: 40,
    },
  )
  .await
  .unwrap();

  // Appended after the tail subscription opened but before the first
  // pull, which fails transiently. The reconnect must resume from the
  // tail captured at open, not from the tail at reconnect time.
  let pos = log
    .append(ChangeOperation::Insert, "new", Some(json!({"v": 1})))
    .await
    .unwrap();

  let event = stream.next_event().await.unwrap();
  assert_eq!(event.position, pos);
  assert_eq!(event.document_key, "new");
}

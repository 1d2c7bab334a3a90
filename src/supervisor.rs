use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::checkpoint::CheckpointStore;
use crate::dispatch::Dispatcher;
use crate::error::{QueueError, RelayError};
use crate::metrics::{MetricsSnapshot, RelayMetrics};
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::source::{ChangeSource, ResilientStream};
use crate::store::ProjectionStore;
use crate::types::DeadLetter;
use crate::worker::{WorkerPool, WorkerPoolConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
  Starting,
  Running,
  Draining,
  Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
  pub workers: WorkerPoolConfig,
  /// Retry budget for enqueue attempts before the dispatcher fail-stops.
  pub enqueue_retry: RetryPolicy,
  /// Retry budget for stream reconnects.
  pub source_retry: RetryPolicy,
  /// Retry budget for the startup dependency probe.
  pub startup_retry: RetryPolicy,
  /// How long draining waits for in-flight jobs before giving up.
  pub drain_grace: Duration,
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self {
      workers: WorkerPoolConfig::default(),
      enqueue_retry: RetryPolicy::default(),
      source_retry: RetryPolicy {
        max_attempts: 10,
        ..RetryPolicy::default()
      },
      startup_retry: RetryPolicy {
        max_attempts: 10,
        base_ms: 500,
        cap_ms: 10_000,
      },
      drain_grace: Duration::from_secs(10),
    }
  }
}

/// Coordinates startup, steady state, and graceful shutdown of one relay
/// instance: `Starting -> Running -> Draining -> Stopped`.
pub struct Supervisor {
  source: Arc<dyn ChangeSource>,
  queue: Arc<dyn WorkQueue>,
  checkpoint: Arc<dyn CheckpointStore>,
  store: Arc<dyn ProjectionStore>,
  metrics: Arc<RelayMetrics>,
  config: SupervisorConfig,
  state_tx: watch::Sender<RelayState>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
  pub fn new(
    source: Arc<dyn ChangeSource>,
    queue: Arc<dyn WorkQueue>,
    checkpoint: Arc<dyn CheckpointStore>,
    store: Arc<dyn ProjectionStore>,
    config: SupervisorConfig,
  ) -> Self {
    let (state_tx, _) = watch::channel(RelayState::Starting);
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      source,
      queue,
      checkpoint,
      store,
      metrics: Arc::new(RelayMetrics::default()),
      config,
      state_tx,
      shutdown_tx,
    }
  }

  /// Request a graceful drain. Safe to call from a signal handler task.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.send(());
  }

  pub fn state(&self) -> RelayState {
    *self.state_tx.borrow()
  }

  /// Watch lifecycle transitions (health surface).
  pub fn watch_state(&self) -> watch::Receiver<RelayState> {
    self.state_tx.subscribe()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  /// Operator view of permanently failed jobs.
  pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
    self.queue.dead_letters().await
  }

  /// Run the relay until a graceful drain completes (`Ok`) or an
  /// unrecoverable error forces it down (`Err`, non-zero exit upstream).
  pub async fn run(&self) -> Result<(), RelayError> {
    // Subscribe before anything can block so an early shutdown request is
    // not lost.
    let mut shutdown_rx = self.shutdown_tx.subscribe();

    self.probe_dependencies().await?;

    let resume = self
      .checkpoint
      .load()
      .await
      .map_err(|e| RelayError::StartupFailed(e.to_string()))?;
    tracing::info!("resuming from {:?}", resume.map(|t| t.position));

    let stream = ResilientStream::open(
      self.source.clone(),
      resume,
      self.config.source_retry,
    )
    .await
    .map_err(|e| match e {
      crate::error::SourceError::ResumeLost(msg) => RelayError::ResumeLost(msg),
      other => RelayError::Source(other),
    })?;

    let dispatcher = Dispatcher::new(
      stream,
      self.queue.clone(),
      self.checkpoint.clone(),
      self.metrics.clone(),
      self.config.enqueue_retry,
      self.shutdown_tx.subscribe(),
    );
    let mut dispatcher_task = tokio::spawn(dispatcher.run());

    let pool = WorkerPool::new(
      self.queue.clone(),
      self.store.clone(),
      self.metrics.clone(),
      self.config.workers,
    );
    let mut workers = pool.spawn(&self.shutdown_tx);

    self.state_tx.send_replace(RelayState::Running);
    tracing::info!(
      "relay running with {} workers",
      self.config.workers.concurrency
    );

    let dispatcher_result = tokio::select! {
      _ = shutdown_rx.recv() => None,
      result = &mut dispatcher_task => Some(result),
    };

    self.state_tx.send_replace(RelayState::Draining);
    tracing::info!("draining: waiting for in-flight jobs");
    // Covers the dispatcher-died path; a no-op if shutdown was already
    // broadcast.
    let _ = self.shutdown_tx.send(());

    let drained = tokio::time::timeout(self.config.drain_grace, async {
      while workers.join_next().await.is_some() {}
      if dispatcher_result.is_none() {
        let _ = (&mut dispatcher_task).await;
      }
    })
    .await;
    if drained.is_err() {
      tracing::warn!(
        "drain grace period {:?} elapsed, aborting remaining workers",
        self.config.drain_grace
      );
      workers.abort_all();
      dispatcher_task.abort();
    }

    self.state_tx.send_replace(RelayState::Stopped);
    tracing::info!("relay stopped; {:?}", self.metrics.snapshot());

    match dispatcher_result {
      // Dispatcher ended on its own: propagate its verdict.
      Some(Ok(result)) => result,
      Some(Err(join_err)) => Err(RelayError::StartupFailed(format!(
        "dispatcher task failed: {}",
        join_err
      ))),
      // Operator-requested drain.
      None => Ok(()),
    }
  }

  /// Stay in Starting until the checkpoint and projection stores respond,
  /// retrying with backoff. Bounded: a dependency that never comes up is a
  /// startup failure, not a half-alive relay.
  async fn probe_dependencies(&self) -> Result<(), RelayError> {
    let mut attempt = 0u32;
    loop {
      let checkpoint_ok = self.checkpoint.load().await;
      let store_ok = self.store.get("__probe__").await;
      let queue_ok = self.queue.depth().await;
      let failure = match (&checkpoint_ok, &store_ok, &queue_ok) {
        (Ok(_), Ok(_), Ok(_)) => return Ok(()),
        (Err(e), _, _) => format!("checkpoint store: {}", e),
        (_, Err(e), _) => format!("projection store: {}", e),
        (_, _, Err(e)) => format!("work queue: {}", e),
      };
      if self.config.startup_retry.exhausted(attempt) {
        return Err(RelayError::StartupFailed(failure));
      }
      let delay = self.config.startup_retry.delay(attempt);
      tracing::warn!(
        "startup dependency not ready ({}), retrying in {:?}",
        failure,
        delay
      );
      tokio::time::sleep(delay).await;
      attempt += 1;
    }
  }
}

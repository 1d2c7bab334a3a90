use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinSet;

use crate::error::{ApplyError, StoreError};
use crate::metrics::RelayMetrics;
use crate::queue::{JobLease, WorkQueue};
use crate::store::ProjectionStore;
use crate::types::{ChangeEvent, ChangeOperation, Job};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
  pub concurrency: usize,
  /// Sleep between polls when the queue is empty.
  pub idle_poll: Duration,
  /// Per-call store timeout; an elapsed timeout counts as transient.
  pub io_timeout: Duration,
}

impl Default for WorkerPoolConfig {
  fn default() -> Self {
    Self {
      concurrency: 20,
      idle_poll: Duration::from_millis(50),
      io_timeout: Duration::from_secs(5),
    }
  }
}

/// Outcome of one conditional application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
  /// The write took effect.
  Applied,
  /// The store already held this position or a later one; dropped as
  /// stale. Acknowledged as success, which is what makes redelivery and
  /// out-of-order retries harmless.
  Stale,
}

/// Fixed-size pool of concurrent job consumers.
///
/// Job failures are contained per job and never take a worker down; the
/// only way a worker exits is the shutdown signal, observed between jobs so
/// an in-flight write always completes.
pub struct WorkerPool {
  queue: Arc<dyn WorkQueue>,
  store: Arc<dyn ProjectionStore>,
  metrics: Arc<RelayMetrics>,
  config: WorkerPoolConfig,
}

impl WorkerPool {
  pub fn new(
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ProjectionStore>,
    metrics: Arc<RelayMetrics>,
    config: WorkerPoolConfig,
  ) -> Self {
    Self {
      queue,
      store,
      metrics,
      config,
    }
  }

  pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for worker_id in 0..self.config.concurrency {
      let queue = self.queue.clone();
      let store = self.store.clone();
      let metrics = self.metrics.clone();
      let config = self.config;
      let shutdown_rx = shutdown.subscribe();
      set.spawn(async move {
        worker_loop(worker_id, queue, store, metrics, config, shutdown_rx).await;
      });
    }
    set
  }
}

async fn worker_loop(
  worker_id: usize,
  queue: Arc<dyn WorkQueue>,
  store: Arc<dyn ProjectionStore>,
  metrics: Arc<RelayMetrics>,
  config: WorkerPoolConfig,
  mut shutdown: broadcast::Receiver<()>,
) {
  tracing::debug!("worker {} started", worker_id);
  loop {
    match shutdown.try_recv() {
      Err(TryRecvError::Empty) => {}
      _ => break,
    }
    // reserve() is never raced against the shutdown signal: cancelling it
    // mid-call could leave a job leased and attempt-charged with nobody
    // processing it. It returns promptly (Ok(None) on an empty queue), so
    // the signal is polled between calls and awaited only during the idle
    // sleep, which is safe to cancel.
    let lease = match queue.reserve().await {
      Ok(Some(lease)) => lease,
      Ok(None) => {
        tokio::select! {
          _ = shutdown.recv() => break,
          _ = tokio::time::sleep(config.idle_poll) => {}
        }
        continue;
      }
      Err(e) => {
        tracing::warn!("worker {}: reserve failed: {}", worker_id, e);
        tokio::time::sleep(config.idle_poll).await;
        continue;
      }
    };

    // From here the job runs to completion; cancellation is only observed
    // back at the top of the loop.
    process_lease(&*queue, &*store, &metrics, config, &lease).await;
  }
  tracing::debug!("worker {} stopped", worker_id);
}

async fn process_lease(
  queue: &dyn WorkQueue,
  store: &dyn ProjectionStore,
  metrics: &RelayMetrics,
  config: WorkerPoolConfig,
  lease: &JobLease,
) {
  let outcome = match decode_job(lease) {
    Ok(job) => apply_event(store, &job.event, config.io_timeout).await,
    Err(e) => Err(e),
  };

  match outcome {
    Ok(Applied::Applied) => {
      metrics.job_applied();
      if let Err(e) = queue.ack(lease).await {
        // The write is durable; a lost ack only means a redelivery that
        // the staleness check will drop.
        tracing::warn!("ack failed for job {}: {}", lease.job_id, e);
      }
    }
    Ok(Applied::Stale) => {
      metrics.stale_drop();
      tracing::debug!("job {} stale, dropped", lease.job_id);
      if let Err(e) = queue.ack(lease).await {
        tracing::warn!("ack failed for job {}: {}", lease.job_id, e);
      }
    }
    Err(ApplyError::Transient(e)) => {
      metrics.transient_retry();
      tracing::warn!(
        "job {} (attempt {}) hit transient store failure: {}",
        lease.job_id,
        lease.attempt,
        e
      );
      if let Err(e) = queue.nack(lease).await {
        tracing::warn!("nack failed for job {}: {}", lease.job_id, e);
      }
    }
    Err(ApplyError::Permanent(reason)) => {
      metrics.dead_letter();
      tracing::error!("job {} dead-lettered: {}", lease.job_id, reason);
      if let Err(e) = queue.dead_letter(lease, &reason).await {
        tracing::warn!("dead-letter failed for job {}: {}", lease.job_id, e);
      }
    }
  }
}

fn decode_job(lease: &JobLease) -> Result<Job, ApplyError> {
  serde_json::from_str(&lease.payload)
    .map_err(|e| ApplyError::Permanent(format!("malformed job payload: {}", e)))
}

/// Apply one change event to the projection store.
///
/// The position check lives inside the store's conditional write, so this
/// function stays a straight dispatch on the operation type.
pub async fn apply_event(
  store: &dyn ProjectionStore,
  event: &ChangeEvent,
  io_timeout: Duration,
) -> Result<Applied, ApplyError> {
  let applied = match event.operation {
    ChangeOperation::Insert | ChangeOperation::Update => {
      let Some(doc) = &event.full_document else {
        return Err(ApplyError::Permanent(format!(
          "{} event for {} carries no document",
          event.operation, event.document_key
        )));
      };
      with_timeout(
        io_timeout,
        store.conditional_upsert(&event.document_key, doc, event.position),
      )
      .await?
    }
    ChangeOperation::Delete => {
      with_timeout(
        io_timeout,
        store.conditional_delete(&event.document_key, event.position),
      )
      .await?
    }
  };
  Ok(if applied {
    Applied::Applied
  } else {
    Applied::Stale
  })
}

async fn with_timeout<F>(limit: Duration, fut: F) -> Result<bool, StoreError>
where
  F: std::future::Future<Output = Result<bool, StoreError>>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(result) => result,
    Err(_) => Err(StoreError(format!("store call exceeded {:?}", limit))),
  }
}

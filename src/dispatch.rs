use std::sync::Arc;
use tokio::sync::broadcast;

use crate::checkpoint::CheckpointStore;
use crate::error::{QueueError, RelayError, SourceError};
use crate::metrics::RelayMetrics;
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::source::ResilientStream;
use crate::types::{Job, ResumeToken};

/// Single logical thread of control per source stream.
///
/// Pulls one event at a time, enqueues it under its document key, and only
/// then persists the resume token. Running more than one dispatcher against
/// the same stream would break per-stream ordering; parallelism across
/// streams is separate dispatcher instances.
pub struct Dispatcher {
  stream: ResilientStream,
  queue: Arc<dyn WorkQueue>,
  checkpoint: Arc<dyn CheckpointStore>,
  metrics: Arc<RelayMetrics>,
  enqueue_retry: RetryPolicy,
  shutdown: broadcast::Receiver<()>,
}

impl Dispatcher {
  pub fn new(
    stream: ResilientStream,
    queue: Arc<dyn WorkQueue>,
    checkpoint: Arc<dyn CheckpointStore>,
    metrics: Arc<RelayMetrics>,
    enqueue_retry: RetryPolicy,
    shutdown: broadcast::Receiver<()>,
  ) -> Self {
    Self {
      stream,
      queue,
      checkpoint,
      metrics,
      enqueue_retry,
      shutdown,
    }
  }

  /// Run until shutdown (returns `Ok`) or a fatal ingestion error.
  ///
  /// Fatal means fail-stop: the resume token is never advanced past an
  /// event that was not durably enqueued, so a restart redelivers instead
  /// of losing it.
  pub async fn run(mut self) -> Result<(), RelayError> {
    loop {
      let event = tokio::select! {
        _ = self.shutdown.recv() => {
          tracing::info!("dispatcher draining at {}", self.stream.last_position());
          return Ok(());
        }
        event = self.stream.next_event() => match event {
          Ok(event) => event,
          Err(SourceError::ResumeLost(msg)) => {
            tracing::error!("resume position lost, full resync required: {}", msg);
            return Err(RelayError::ResumeLost(msg));
          }
          Err(SourceError::Transient(msg)) => {
            tracing::error!("change stream failed permanently: {}", msg);
            return Err(RelayError::Source(SourceError::Transient(msg)));
          }
        },
      };
      self.metrics.event_ingested();

      let position = event.position;
      let key = event.document_key.clone();
      let job = Job::new(event);
      self.enqueue_with_retry(&key, &job).await?;
      self.metrics.job_enqueued();

      // Only now is the position safe to acknowledge to the source.
      self
        .checkpoint
        .save(ResumeToken::at(position))
        .await
        .map_err(|e| RelayError::CheckpointUnavailable(e.to_string()))?;
      tracing::debug!("enqueued {} at position {}", key, position);
    }
  }

  async fn enqueue_with_retry(&mut self, key: &str, job: &Job) -> Result<(), RelayError> {
    let mut attempt = 0u32;
    loop {
      match self.queue.enqueue(key, job).await {
        Ok(_) => return Ok(()),
        Err(QueueError::Corrupt(msg)) => {
          // Serialization of our own job failing is not retryable.
          return Err(RelayError::QueueUnavailable {
            attempts: attempt + 1,
            last: msg,
          });
        }
        Err(QueueError::Transient(msg)) => {
          self.metrics.transient_retry();
          if self.enqueue_retry.exhausted(attempt) {
            return Err(RelayError::QueueUnavailable {
              attempts: attempt + 1,
              last: msg,
            });
          }
          let delay = self.enqueue_retry.delay(attempt);
          tracing::warn!(
            "enqueue failed ({}), retry {} in {:?}",
            msg,
            attempt + 1,
            delay
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}

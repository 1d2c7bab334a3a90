mod sqlite;

pub use sqlite::{QueueSettings, SqliteQueue};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::{DeadLetter, Job};

/// A job handed to exactly one worker for the duration of its lease.
///
/// The payload is kept as raw text so a malformed job can still be
/// inspected and dead-lettered instead of being lost in decode.
#[derive(Debug, Clone)]
pub struct JobLease {
  pub id: i64,
  pub job_id: Uuid,
  pub key: String,
  pub payload: String,
  /// Delivery count including this one.
  pub attempt: u32,
}

/// Durable at-least-once work queue.
///
/// A reserved job that is never acknowledged becomes visible again once its
/// lease expires; `nack` reschedules it with backoff; after the retry budget
/// is spent the queue moves it to the dead-letter table on its own.
#[async_trait]
pub trait WorkQueue: Send + Sync {
  /// Enqueue a job under a routing key (the document key). Returns the
  /// job id assigned by the queue.
  async fn enqueue(&self, key: &str, job: &Job) -> Result<Uuid, QueueError>;

  /// Reserve the next visible job, if any. Non-blocking: `None` means the
  /// queue is currently empty.
  async fn reserve(&self) -> Result<Option<JobLease>, QueueError>;

  /// Acknowledge successful processing; the job is gone for good.
  async fn ack(&self, lease: &JobLease) -> Result<(), QueueError>;

  /// Return the job for redelivery after a backoff delay.
  async fn nack(&self, lease: &JobLease) -> Result<(), QueueError>;

  /// Park the job for operator inspection and stop redelivering it.
  async fn dead_letter(&self, lease: &JobLease, reason: &str) -> Result<(), QueueError>;

  async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

  /// Number of jobs not yet acknowledged (live, not dead-lettered).
  async fn depth(&self) -> Result<u64, QueueError>;
}

use thiserror::Error;

/// Failures raised by the change source adapter.
#[derive(Debug, Error)]
pub enum SourceError {
  /// Upstream hiccup (disconnect, timeout). The stream wrapper reconnects
  /// and resumes from the last yielded position.
  #[error("transient source failure: {0}")]
  Transient(String),

  /// The resume position has aged out of the feed's retained history. The
  /// instance cannot continue without a full resynchronization.
  #[error("resume position no longer available: {0}")]
  ResumeLost(String),
}

/// Failures raised by the durable work queue.
#[derive(Debug, Error)]
pub enum QueueError {
  #[error("transient queue failure: {0}")]
  Transient(String),

  /// A stored row could not be decoded. Surfaced, never skipped silently.
  #[error("corrupt queue entry: {0}")]
  Corrupt(String),
}

/// Failures raised by the checkpoint and projection stores. Everything at
/// this layer is retryable; redelivery policy decides how.
#[derive(Debug, Error)]
#[error("transient store failure: {0}")]
pub struct StoreError(pub String);

/// Per-job application outcome classification for the worker pool.
#[derive(Debug, Error)]
pub enum ApplyError {
  /// Store temporarily unavailable. The job is not acknowledged; the
  /// queue's retry/backoff policy governs redelivery.
  #[error(transparent)]
  Transient(#[from] StoreError),

  /// The job can never succeed (malformed payload). Routed to dead-letter
  /// and acknowledged to stop redelivery loops.
  #[error("permanent apply failure: {0}")]
  Permanent(String),
}

/// Top-level relay failure, surfaced by the dispatcher and supervisor.
#[derive(Debug, Error)]
pub enum RelayError {
  /// Resume position invalidated upstream; requires external resync and is
  /// fatal to this instance (non-zero exit).
  #[error("resume position lost: {0}")]
  ResumeLost(String),

  /// Enqueue retries exhausted. The dispatcher fail-stops rather than
  /// dropping the event.
  #[error("work queue unavailable after {attempts} attempts: {last}")]
  QueueUnavailable { attempts: u32, last: String },

  /// Checkpoint persistence failed; ingestion halts so the redelivery
  /// window stays bounded.
  #[error("checkpoint store unavailable: {0}")]
  CheckpointUnavailable(String),

  /// A startup dependency never became reachable.
  #[error("startup dependency unreachable: {0}")]
  StartupFailed(String),

  #[error(transparent)]
  Source(#[from] SourceError),
}

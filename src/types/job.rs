use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChangeEvent;

/// Unit of work carried by the queue.
///
/// Owned exclusively by the queue between enqueue and acknowledgment;
/// ownership transfers to exactly one worker at a time (within the lease).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub event: ChangeEvent,
  pub attempt: u32,
  pub enqueued_at: DateTime<Utc>,
}

impl Job {
  pub fn new(event: ChangeEvent) -> Self {
    Self {
      event,
      attempt: 0,
      enqueued_at: Utc::now(),
    }
  }
}

/// A job that permanently failed processing, parked for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
  pub key: String,
  pub payload: String,
  pub attempts: u32,
  pub reason: String,
  pub dead_at: DateTime<Utc>,
}

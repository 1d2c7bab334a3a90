use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay-wide counters. Shared via `Arc`, updated lock-free.
#[derive(Debug, Default)]
pub struct RelayMetrics {
  events_ingested: AtomicU64,
  jobs_enqueued: AtomicU64,
  jobs_applied: AtomicU64,
  stale_drops: AtomicU64,
  transient_retries: AtomicU64,
  dead_letters: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
  pub events_ingested: u64,
  pub jobs_enqueued: u64,
  pub jobs_applied: u64,
  pub stale_drops: u64,
  pub transient_retries: u64,
  pub dead_letters: u64,
}

impl RelayMetrics {
  pub fn event_ingested(&self) {
    self.events_ingested.fetch_add(1, Ordering::Relaxed);
  }

  pub fn job_enqueued(&self) {
    self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
  }

  pub fn job_applied(&self) {
    self.jobs_applied.fetch_add(1, Ordering::Relaxed);
  }

  pub fn stale_drop(&self) {
    self.stale_drops.fetch_add(1, Ordering::Relaxed);
  }

  pub fn transient_retry(&self) {
    self.transient_retries.fetch_add(1, Ordering::Relaxed);
  }

  pub fn dead_letter(&self) {
    self.dead_letters.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      events_ingested: self.events_ingested.load(Ordering::Relaxed),
      jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
      jobs_applied: self.jobs_applied.load(Ordering::Relaxed),
      stale_drops: self.stale_drops.load(Ordering::Relaxed),
      transient_retries: self.transient_retries.load(Ordering::Relaxed),
      dead_letters: self.dead_letters.load(Ordering::Relaxed),
    }
  }
}

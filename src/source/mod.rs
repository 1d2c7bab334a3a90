mod sqlite;

pub use sqlite::SqliteChangeLog;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SourceError;
use crate::retry::RetryPolicy;
use crate::types::{ChangeEvent, Position, ResumeToken};

/// An ordered, resumable feed of mutation events from the upstream store.
///
/// Only Insert/Update/Delete operations are ever yielded; implementations
/// filter everything else at the subscription level.
#[async_trait]
pub trait ChangeSource: Send + Sync {
  /// Open the feed. `from` resumes strictly after the given position;
  /// `None` starts from the current tail.
  async fn subscribe(
    &self,
    from: Option<ResumeToken>,
  ) -> Result<Box<dyn EventStream>, SourceError>;
}

/// Pull-based view of one open subscription. Infinite: `next_event` waits
/// until an event is available. The caller pulls one event at a time, which
/// is the backpressure mechanism.
#[async_trait]
pub trait EventStream: Send {
  async fn next_event(&mut self) -> Result<ChangeEvent, SourceError>;

  /// Position the stream currently stands at; every event yielded from
  /// here on is strictly after it. For a tail subscription this is the
  /// tail at open time, which lets a wrapper resume without skipping
  /// events appended since.
  fn position(&self) -> Position;
}

impl std::fmt::Debug for dyn EventStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventStream")
      .field("position", &self.position())
      .finish()
  }
}

/// Stream wrapper that survives transient upstream failures.
///
/// Tracks the last yielded position and reconnects from it with bounded
/// backoff, so no event is skipped and the stream is never silently
/// dropped. A lost resume position is propagated unchanged: that failure
/// needs a full resync, not a reconnect.
pub struct ResilientStream {
  source: Arc<dyn ChangeSource>,
  inner: Box<dyn EventStream>,
  last: Position,
  policy: RetryPolicy,
}

impl ResilientStream {
  pub async fn open(
    source: Arc<dyn ChangeSource>,
    from: Option<ResumeToken>,
    policy: RetryPolicy,
  ) -> Result<Self, SourceError> {
    let inner = source.subscribe(from).await?;
    // Anchor on the subscription's own starting position. For a tail
    // start (`from = None`) this pins the tail at open time, so a
    // reconnect before the first event resumes from there instead of
    // re-tailing past anything appended in between.
    let last = inner.position();
    Ok(Self {
      source,
      inner,
      last,
      policy,
    })
  }

  /// Last position handed to the caller, or the subscription's starting
  /// position if no event has been yielded yet.
  pub fn last_position(&self) -> Position {
    self.last
  }

  pub async fn next_event(&mut self) -> Result<ChangeEvent, SourceError> {
    let mut attempt = 0u32;
    loop {
      match self.inner.next_event().await {
        Ok(event) => {
          self.last = event.position;
          return Ok(event);
        }
        Err(SourceError::ResumeLost(msg)) => return Err(SourceError::ResumeLost(msg)),
        Err(SourceError::Transient(msg)) => {
          if self.policy.exhausted(attempt) {
            return Err(SourceError::Transient(format!(
              "reconnect attempts exhausted: {}",
              msg
            )));
          }
          let delay = self.policy.delay(attempt);
          tracing::warn!(
            "change stream error ({}), reconnecting from {} in {:?}",
            msg,
            self.last,
            delay
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
          match self.source.subscribe(Some(ResumeToken::at(self.last))).await {
            Ok(stream) => {
              self.inner = stream;
            }
            Err(SourceError::ResumeLost(msg)) => return Err(SourceError::ResumeLost(msg)),
            Err(SourceError::Transient(msg)) => {
              tracing::warn!("resubscribe failed: {}", msg);
            }
          }
        }
      }
    }
  }
}

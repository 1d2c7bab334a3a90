mod sqlite;

pub use sqlite::SqliteCheckpoint;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::ResumeToken;

/// Durable record of the last successfully ingested position.
///
/// Ordering contract: `save` is called only after the corresponding events
/// are confirmed enqueued on the work queue, never before. A crash between
/// enqueue and save costs at most redelivery, never loss.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
  async fn load(&self) -> Result<Option<ResumeToken>, StoreError>;

  /// Must be durable before returning.
  async fn save(&self, token: ResumeToken) -> Result<(), StoreError>;
}

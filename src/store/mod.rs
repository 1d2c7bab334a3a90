mod sqlite;

pub use sqlite::SqliteProjection;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Position, ProjectedDocument};

/// Key-value projection of the upstream data, one entry per document key.
///
/// Both writes are conditional on the stored `last_applied_position` and the
/// comparison is atomic at the storage layer. Two workers racing on the same
/// key therefore cannot lose an update: the stale one simply does not apply.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
  /// Write `value` at `position` unless the stored position is already at
  /// or past it. Returns whether the write applied.
  async fn conditional_upsert(
    &self,
    key: &str,
    value: &serde_json::Value,
    position: Position,
  ) -> Result<bool, StoreError>;

  /// Remove the entry unless its stored position is at or past
  /// `min_position`. Returns whether the delete took effect; a stale
  /// delete is a no-op and reports `false`.
  async fn conditional_delete(&self, key: &str, min_position: Position)
    -> Result<bool, StoreError>;

  async fn get(&self, key: &str) -> Result<Option<ProjectedDocument>, StoreError>;
}

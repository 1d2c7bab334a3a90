use async_trait::async_trait;
use rusqlite::params;
use tokio_rusqlite::Connection;

use super::ProjectionStore;
use crate::error::StoreError;
use crate::types::{Position, ProjectedDocument};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS projections (
    key TEXT PRIMARY KEY,
    value TEXT,
    position INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;
"#;

/// SQLite projection store. Deletes leave a tombstone (NULL value, deleted
/// flag) so a late redelivery of an older write still has a position to
/// compare against and stays a no-op.
pub struct SqliteProjection {
  conn: Connection,
}

impl SqliteProjection {
  pub async fn new(path: &str) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };
    conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:").await
  }
}

#[async_trait]
impl ProjectionStore for SqliteProjection {
  async fn conditional_upsert(
    &self,
    key: &str,
    value: &serde_json::Value,
    position: Position,
  ) -> Result<bool, StoreError> {
    let key = key.to_string();
    let value = value.to_string();
    let pos = position.0 as i64;
    let applied = self
      .conn
      .call(move |conn| {
        // Single statement: the position comparison happens inside the
        // engine, not in application code, so concurrent workers cannot
        // interleave a read-modify-write.
        let changed = conn.execute(
          "INSERT INTO projections (key, value, position, deleted) VALUES (?1, ?2, ?3, 0)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                          position = excluded.position,
                                          deleted = 0
           WHERE excluded.position > projections.position",
          params![key, value, pos],
        )?;
        Ok(changed > 0)
      })
      .await
      .map_err(|e| StoreError(e.to_string()))?;
    Ok(applied)
  }

  async fn conditional_delete(
    &self,
    key: &str,
    min_position: Position,
  ) -> Result<bool, StoreError> {
    let key = key.to_string();
    let pos = min_position.0 as i64;
    let applied = self
      .conn
      .call(move |conn| {
        // A delete for a key that was never projected still writes a
        // tombstone. Without it, a slower worker holding the older insert
        // could resurrect the document.
        let changed = conn.execute(
          "INSERT INTO projections (key, value, position, deleted) VALUES (?1, NULL, ?2, 1)
           ON CONFLICT(key) DO UPDATE SET value = NULL,
                                          deleted = 1,
                                          position = excluded.position
           WHERE excluded.position > projections.position",
          params![key, pos],
        )?;
        Ok(changed > 0)
      })
      .await
      .map_err(|e| StoreError(e.to_string()))?;
    Ok(applied)
  }

  async fn get(&self, key: &str) -> Result<Option<ProjectedDocument>, StoreError> {
    let key_owned = key.to_string();
    let row: Option<(String, Option<String>, i64, bool)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT key, value, position, deleted FROM projections WHERE key = ?1",
        )?;
        let mut rows = stmt.query(params![key_owned])?;
        let Some(row) = rows.next()? else {
          return Ok(None);
        };
        Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      })
      .await
      .map_err(|e| StoreError(e.to_string()))?;

    let Some((key, value, position, deleted)) = row else {
      return Ok(None);
    };
    if deleted {
      return Ok(None);
    }
    let Some(value) = value else {
      return Ok(None);
    };
    let value = serde_json::from_str(&value).map_err(|e| StoreError(e.to_string()))?;
    Ok(Some(ProjectedDocument {
      key,
      value,
      last_applied_position: Position(position as u64),
    }))
  }
}

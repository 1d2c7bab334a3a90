use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;

use super::CheckpointStore;
use crate::error::StoreError;
use crate::types::{Position, ResumeToken};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS resume_token (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    position INTEGER NOT NULL,
    persisted_at TEXT NOT NULL
);
"#;

/// Single-row resume token record. `synchronous = FULL` so a completed
/// `save` survives power loss, which is the whole point of this store.
pub struct SqliteCheckpoint {
  conn: Connection,
}

impl SqliteCheckpoint {
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
impl CheckpointStore for SqliteCheckpoint {
  async fn load(&self) -> Result<Option<ResumeToken>, StoreError> {
    let row: Option<(i64, String)> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare_cached("SELECT position, persisted_at FROM resume_token WHERE id = 1")?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
          return Ok(None);
        };
        Ok(Some((row.get(0)?, row.get(1)?)))
      })
      .await
      .map_err(|e| StoreError(e.to_string()))?;

    Ok(row.map(|(position, persisted_at)| ResumeToken {
      position: Position(position as u64),
      persisted_at: DateTime::parse_from_rfc3339(&persisted_at)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now()),
    }))
  }

  async fn save(&self, token: ResumeToken) -> Result<(), StoreError> {
    let position = token.position.0 as i64;
    let persisted_at = token.persisted_at.to_rfc3339();
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO resume_token (id, position, persisted_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET position = excluded.position,
                                           persisted_at = excluded.persisted_at",
            params![position, persisted_at],
          )
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| StoreError(e.to_string()))?;
    Ok(())
  }
}

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use std::time::Duration;
use tokio_rusqlite::Connection;

use super::{ChangeSource, EventStream};
use crate::error::SourceError;
use crate::types::{ChangeEvent, ChangeOperation, Position, ResumeToken};

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    document_key TEXT NOT NULL,
    full_document TEXT,
    changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS change_log_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    horizon INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO change_log_meta (id, horizon) VALUES (1, 0);
"#;

/// Append-only change feed backed by a SQLite table. The rowid doubles as
/// the position token: strictly increasing, totally ordered.
///
/// `prune_before` models upstream history truncation: resuming from a
/// position older than the pruned horizon fails permanently.
pub struct SqliteChangeLog {
  conn: Connection,
  poll_interval: Duration,
  batch_size: u32,
}

impl SqliteChangeLog {
  pub async fn new(path: &str, poll_interval: Duration, batch_size: u32) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };
    conn
      .call(|conn| {
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA).map_err(|e| e.into())
      })
      .await?;
    Ok(Self {
      conn,
      poll_interval,
      batch_size,
    })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:", Duration::from_millis(20), 100).await
  }

  /// Producer-side append. Returns the position assigned to the event.
  pub async fn append(
    &self,
    operation: ChangeOperation,
    document_key: &str,
    full_document: Option<serde_json::Value>,
  ) -> Result<Position, anyhow::Error> {
    let key = document_key.to_string();
    let doc = full_document.map(|d| d.to_string());
    let now = Utc::now().to_rfc3339();
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO change_log (operation, document_key, full_document, changed_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![operation.to_string(), key, doc, now],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;
    Ok(Position(id as u64))
  }

  /// Drop feed history at and before `position` and advance the resume
  /// horizon. Subscriptions from positions older than the horizon fail
  /// with `ResumeLost`.
  pub async fn prune_before(&self, position: Position) -> Result<(), anyhow::Error> {
    let pos = position.0 as i64;
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM change_log WHERE id <= ?1", params![pos])?;
        tx.execute(
          "UPDATE change_log_meta SET horizon = MAX(horizon, ?1) WHERE id = 1",
          params![pos],
        )?;
        tx.commit().map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn horizon(&self) -> Result<u64, SourceError> {
    self
      .conn
      .call(|conn| {
        conn
          .query_row("SELECT horizon FROM change_log_meta WHERE id = 1", [], |r| {
            r.get::<_, i64>(0)
          })
          .map_err(|e| e.into())
      })
      .await
      .map(|h| h as u64)
      .map_err(|e| SourceError::Transient(e.to_string()))
  }

  async fn tail(&self) -> Result<u64, SourceError> {
    self
      .conn
      .call(|conn| {
        conn
          .query_row("SELECT COALESCE(MAX(id), 0) FROM change_log", [], |r| {
            r.get::<_, i64>(0)
          })
          .map_err(|e| e.into())
      })
      .await
      .map(|t| t as u64)
      .map_err(|e| SourceError::Transient(e.to_string()))
  }
}

#[async_trait]
impl ChangeSource for SqliteChangeLog {
  async fn subscribe(
    &self,
    from: Option<ResumeToken>,
  ) -> Result<Box<dyn EventStream>, SourceError> {
    let horizon = self.horizon().await?;
    let cursor = match from {
      Some(token) => {
        if token.position.0 < horizon {
          return Err(SourceError::ResumeLost(format!(
            "position {} is behind the feed horizon {}",
            token.position, horizon
          )));
        }
        token.position.0
      }
      None => self.tail().await?,
    };
    Ok(Box::new(SqliteChangeStream {
      conn: self.conn.clone(),
      cursor: cursor as i64,
      delivered: cursor as i64,
      poll_interval: self.poll_interval,
      batch_size: self.batch_size,
      buffered: std::collections::VecDeque::new(),
    }))
  }
}

struct SqliteChangeStream {
  conn: Connection,
  // `cursor` is how far fetching has read; `delivered` is how far the
  // caller has consumed. They diverge while a batch sits buffered.
  cursor: i64,
  delivered: i64,
  poll_interval: Duration,
  batch_size: u32,
  buffered: std::collections::VecDeque<ChangeEvent>,
}

impl SqliteChangeStream {
  async fn fetch_batch(&mut self) -> Result<(), SourceError> {
    let cursor = self.cursor;
    let limit = self.batch_size as i64;
    let rows: Vec<(i64, String, String, Option<String>)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT id, operation, document_key, full_document FROM change_log
           WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![cursor, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          out.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
        }
        Ok(out)
      })
      .await
      .map_err(|e| SourceError::Transient(e.to_string()))?;

    for (id, op_str, key, doc) in rows {
      self.cursor = id;
      // The feed only records Insert/Update/Delete; anything else is
      // filtered rather than surfaced.
      let Ok(operation) = op_str.parse::<ChangeOperation>() else {
        continue;
      };
      let full_document = doc.and_then(|d| serde_json::from_str(&d).ok());
      self.buffered.push_back(ChangeEvent {
        operation,
        document_key: key,
        full_document,
        position: Position(id as u64),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl EventStream for SqliteChangeStream {
  async fn next_event(&mut self) -> Result<ChangeEvent, SourceError> {
    loop {
      if let Some(event) = self.buffered.pop_front() {
        self.delivered = event.position.0 as i64;
        return Ok(event);
      }
      self.fetch_batch().await?;
      if self.buffered.is_empty() {
        tokio::time::sleep(self.poll_interval).await;
      }
    }
  }

  fn position(&self) -> Position {
    Position(self.delivered as u64)
  }
}

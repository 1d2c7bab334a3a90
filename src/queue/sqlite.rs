use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use super::{JobLease, WorkQueue};
use crate::error::QueueError;
use crate::retry::RetryPolicy;
use crate::types::{DeadLetter, Job};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    key TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL,
    visible_at INTEGER NOT NULL,
    leased_until INTEGER
);
CREATE INDEX IF NOT EXISTS idx_jobs_visible ON jobs(visible_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    dead_at TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
  pub retry: RetryPolicy,
  /// How long a reservation protects a job from other workers. An expired
  /// lease makes the job visible again, which is what turns a worker crash
  /// into redelivery instead of loss.
  pub lease_ms: u64,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      lease_ms: 30_000,
    }
  }
}

/// SQLite-backed durable work queue. Reservation is a single atomic
/// `UPDATE ... RETURNING`, so two workers can never hold the same job.
pub struct SqliteQueue {
  conn: Connection,
  settings: QueueSettings,
}

impl SqliteQueue {
  pub async fn new(path: &str, settings: QueueSettings) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };
    conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    Ok(Self { conn, settings })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:", QueueSettings::default()).await
  }

  pub async fn in_memory_with(settings: QueueSettings) -> Result<Self, anyhow::Error> {
    Self::new(":memory:", settings).await
  }
}

fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

#[async_trait]
impl WorkQueue for SqliteQueue {
  async fn enqueue(&self, key: &str, job: &Job) -> Result<Uuid, QueueError> {
    let job_id = Uuid::new_v4();
    let key = key.to_string();
    let payload =
      serde_json::to_string(job).map_err(|e| QueueError::Corrupt(e.to_string()))?;
    let enqueued_at = job.enqueued_at.to_rfc3339();
    let id_str = job_id.to_string();
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO jobs (job_id, key, payload, attempts, enqueued_at, visible_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![id_str, key, payload, enqueued_at, now_ms()],
          )
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| QueueError::Transient(e.to_string()))?;
    Ok(job_id)
  }

  async fn reserve(&self) -> Result<Option<JobLease>, QueueError> {
    let lease_ms = self.settings.lease_ms as i64;
    let max_attempts = self.settings.retry.max_attempts;
    let reserved: Option<(i64, String, String, String, u32)> = self
      .conn
      .call(move |conn| {
        // Loop because an over-budget job is parked in the same pass and
        // the next candidate is tried.
        loop {
          let now = now_ms();
          let row = conn
            .query_row(
              "UPDATE jobs
               SET attempts = attempts + 1, leased_until = ?1
               WHERE id = (
                 SELECT id FROM jobs
                 WHERE visible_at <= ?2 AND (leased_until IS NULL OR leased_until <= ?2)
                 ORDER BY id LIMIT 1
               )
               RETURNING id, job_id, key, payload, attempts",
              params![now + lease_ms, now],
              |r| {
                Ok((
                  r.get::<_, i64>(0)?,
                  r.get::<_, String>(1)?,
                  r.get::<_, String>(2)?,
                  r.get::<_, String>(3)?,
                  r.get::<_, u32>(4)?,
                ))
              },
            )
            .map(Some)
            .or_else(|e| match e {
              rusqlite::Error::QueryReturnedNoRows => Ok(None),
              other => Err(other),
            })?;

          let Some((id, job_id, key, payload, attempts)) = row else {
            return Ok(None);
          };
          if attempts > max_attempts {
            let tx = conn.transaction()?;
            tx.execute(
              "INSERT INTO dead_letters (key, payload, attempts, reason, dead_at)
               SELECT key, payload, attempts, 'retry budget exhausted', ?2
               FROM jobs WHERE id = ?1",
              params![id, Utc::now().to_rfc3339()],
            )?;
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            tx.commit()?;
            continue;
          }
          return Ok(Some((id, job_id, key, payload, attempts)));
        }
      })
      .await
      .map_err(|e| QueueError::Transient(e.to_string()))?;

    let Some((id, job_id, key, payload, attempt)) = reserved else {
      return Ok(None);
    };
    let job_id = job_id
      .parse::<Uuid>()
      .map_err(|e| QueueError::Corrupt(e.to_string()))?;
    Ok(Some(JobLease {
      id,
      job_id,
      key,
      payload,
      attempt,
    }))
  }

  async fn ack(&self, lease: &JobLease) -> Result<(), QueueError> {
    let id = lease.id;
    self
      .conn
      .call(move |conn| {
        conn
          .execute("DELETE FROM jobs WHERE id = ?1", params![id])
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| QueueError::Transient(e.to_string()))?;
    Ok(())
  }

  async fn nack(&self, lease: &JobLease) -> Result<(), QueueError> {
    let id = lease.id;
    let delay = self.settings.retry.delay(lease.attempt.saturating_sub(1));
    let visible_at = now_ms() + delay.as_millis() as i64;
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "UPDATE jobs SET visible_at = ?2, leased_until = NULL WHERE id = ?1",
            params![id, visible_at],
          )
          .map_err(|e| e.into())
      })
      .await
      .map_err(|e| QueueError::Transient(e.to_string()))?;
    Ok(())
  }

  async fn dead_letter(&self, lease: &JobLease, reason: &str) -> Result<(), QueueError> {
    let id = lease.id;
    let reason = reason.to_string();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO dead_letters (key, payload, attempts, reason, dead_at)
           SELECT key, payload, attempts, ?2, ?3 FROM jobs WHERE id = ?1",
          params![id, reason, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        tx.commit().map_err(|e| e.into())
      })
      .await
      .map_err(|e| QueueError::Transient(e.to_string()))?;
    Ok(())
  }

  async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
    self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT key, payload, attempts, reason, dead_at FROM dead_letters ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          let dead_at: String = row.get(4)?;
          out.push(DeadLetter {
            key: row.get(0)?,
            payload: row.get(1)?,
            attempts: row.get(2)?,
            reason: row.get(3)?,
            dead_at: DateTime::parse_from_rfc3339(&dead_at)
              .map(|d| d.with_timezone(&Utc))
              .unwrap_or_else(|_| Utc::now()),
          });
        }
        Ok(out)
      })
      .await
      .map_err(|e| QueueError::Transient(e.to_string()))
  }

  async fn depth(&self) -> Result<u64, QueueError> {
    self
      .conn
      .call(|conn| {
        conn
          .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get::<_, i64>(0))
          .map_err(|e| e.into())
      })
      .await
      .map(|n| n as u64)
      .map_err(|e| QueueError::Transient(e.to_string()))
  }
}

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::queue::QueueSettings;
use crate::retry::RetryPolicy;
use crate::supervisor::SupervisorConfig;
use crate::worker::WorkerPoolConfig;

/// Expand environment variables in a string.
/// Supports $VAR_NAME and ${VAR_NAME} syntax.
fn expand_env_vars(input: &str) -> String {
  let mut result = input.to_string();

  // Handle ${VAR_NAME} syntax first (more specific)
  while let Some(start) = result.find("${") {
    if let Some(end) = result[start..].find('}') {
      let var_name = &result[start + 2..start + end];
      let value = std::env::var(var_name).unwrap_or_default();
      result = format!(
        "{}{}{}",
        &result[..start],
        value,
        &result[start + end + 1..]
      );
    } else {
      break;
    }
  }

  // Handle $VAR_NAME syntax (word boundary: alphanumeric + underscore)
  let mut i = 0;
  while i < result.len() {
    if result[i..].starts_with('$') && !result[i..].starts_with("${") {
      let rest = &result[i + 1..];
      let var_len = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .count();
      if var_len > 0 {
        let var_name = &rest[..var_len];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..i], value, &rest[var_len..]);
        i += value.len();
        continue;
      }
    }
    i += 1;
  }

  result
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
  #[serde(default)]
  pub source: SourceSection,
  #[serde(default)]
  pub checkpoint: CheckpointSection,
  #[serde(default)]
  pub queue: QueueSection,
  #[serde(default)]
  pub store: StoreSection,
  #[serde(default)]
  pub workers: WorkersSection,
  #[serde(default)]
  pub shutdown: ShutdownSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
  /// SQLite path of the change log feed.
  #[serde(default = "default_source_path")]
  pub path: String,
  #[serde(default = "default_source_poll_ms")]
  pub poll_interval_ms: u64,
  #[serde(default = "default_source_batch")]
  pub batch_size: u32,
  /// Stream reconnect budget.
  #[serde(default = "default_source_retry")]
  pub retry: RetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
  #[serde(default = "default_checkpoint_path")]
  pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
  #[serde(default = "default_queue_path")]
  pub path: String,
  /// Redelivery budget per job; exceeded jobs go to the dead-letter table.
  #[serde(default = "default_queue_retry")]
  pub retry: RetrySection,
  #[serde(default = "default_lease_ms")]
  pub lease_ms: u64,
  /// Dispatcher-side enqueue retry budget (fail-stop once spent).
  #[serde(default = "default_enqueue_retry")]
  pub enqueue_retry: RetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
  #[serde(default = "default_store_path")]
  pub path: String,
  #[serde(default = "default_io_timeout_ms")]
  pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersSection {
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,
  #[serde(default = "default_idle_poll_ms")]
  pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
  #[serde(default = "default_grace_ms")]
  pub grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_log_level")]
  pub level: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySection {
  pub max_attempts: u32,
  pub base_ms: u64,
  pub cap_ms: u64,
}

impl From<RetrySection> for RetryPolicy {
  fn from(s: RetrySection) -> Self {
    Self {
      max_attempts: s.max_attempts,
      base_ms: s.base_ms,
      cap_ms: s.cap_ms,
    }
  }
}

fn default_source_path() -> String {
  "relay-source.db".into()
}
fn default_source_poll_ms() -> u64 {
  50
}
fn default_source_batch() -> u32 {
  100
}
fn default_source_retry() -> RetrySection {
  RetrySection {
    max_attempts: 10,
    base_ms: 1000,
    cap_ms: 30_000,
  }
}
fn default_checkpoint_path() -> String {
  "relay-checkpoint.db".into()
}
fn default_queue_path() -> String {
  "relay-queue.db".into()
}
fn default_queue_retry() -> RetrySection {
  RetrySection {
    max_attempts: 3,
    base_ms: 1000,
    cap_ms: 30_000,
  }
}
fn default_lease_ms() -> u64 {
  30_000
}
fn default_enqueue_retry() -> RetrySection {
  RetrySection {
    max_attempts: 5,
    base_ms: 500,
    cap_ms: 15_000,
  }
}
fn default_store_path() -> String {
  "relay-projection.db".into()
}
fn default_io_timeout_ms() -> u64 {
  5000
}
fn default_concurrency() -> usize {
  20
}
fn default_idle_poll_ms() -> u64 {
  50
}
fn default_grace_ms() -> u64 {
  10_000
}
fn default_log_level() -> String {
  "info".into()
}

impl Default for SourceSection {
  fn default() -> Self {
    Self {
      path: default_source_path(),
      poll_interval_ms: default_source_poll_ms(),
      batch_size: default_source_batch(),
      retry: default_source_retry(),
    }
  }
}

impl Default for CheckpointSection {
  fn default() -> Self {
    Self {
      path: default_checkpoint_path(),
    }
  }
}

impl Default for QueueSection {
  fn default() -> Self {
    Self {
      path: default_queue_path(),
      retry: default_queue_retry(),
      lease_ms: default_lease_ms(),
      enqueue_retry: default_enqueue_retry(),
    }
  }
}

impl Default for StoreSection {
  fn default() -> Self {
    Self {
      path: default_store_path(),
      io_timeout_ms: default_io_timeout_ms(),
    }
  }
}

impl Default for WorkersSection {
  fn default() -> Self {
    Self {
      concurrency: default_concurrency(),
      idle_poll_ms: default_idle_poll_ms(),
    }
  }
}

impl Default for ShutdownSection {
  fn default() -> Self {
    Self {
      grace_ms: default_grace_ms(),
    }
  }
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_log_level(),
    }
  }
}

impl RelayConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    let expanded = expand_env_vars(&content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["syncrelay.yaml", "syncrelay.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }

  pub fn queue_settings(&self) -> QueueSettings {
    QueueSettings {
      retry: self.queue.retry.into(),
      lease_ms: self.queue.lease_ms,
    }
  }

  pub fn supervisor_config(&self) -> SupervisorConfig {
    SupervisorConfig {
      workers: WorkerPoolConfig {
        concurrency: self.workers.concurrency,
        idle_poll: Duration::from_millis(self.workers.idle_poll_ms),
        io_timeout: Duration::from_millis(self.store.io_timeout_ms),
      },
      enqueue_retry: self.queue.enqueue_retry.into(),
      source_retry: self.source.retry.into(),
      drain_grace: Duration::from_millis(self.shutdown.grace_ms),
      ..SupervisorConfig::default()
    }
  }
}

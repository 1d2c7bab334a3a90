use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncrelay::checkpoint::SqliteCheckpoint;
use syncrelay::config::RelayConfig;
use syncrelay::queue::SqliteQueue;
use syncrelay::source::SqliteChangeLog;
use syncrelay::store::SqliteProjection;
use syncrelay::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "syncrelayd", about = "Change-data-capture relay daemon", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "SYNCRELAY_SOURCE_PATH")]
  source: Option<String>,
  #[arg(long, env = "SYNCRELAY_QUEUE_PATH")]
  queue: Option<String>,
  #[arg(long, env = "SYNCRELAY_STORE_PATH")]
  store: Option<String>,
  #[arg(long, env = "SYNCRELAY_CHECKPOINT_PATH")]
  checkpoint: Option<String>,
  #[arg(long)]
  concurrency: Option<usize>,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    RelayConfig::from_file(path)?
  } else {
    RelayConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(path) = args.source {
    config.source.path = path;
  }
  if let Some(path) = args.queue {
    config.queue.path = path;
  }
  if let Some(path) = args.store {
    config.store.path = path;
  }
  if let Some(path) = args.checkpoint {
    config.checkpoint.path = path;
  }
  if let Some(n) = args.concurrency {
    config.workers.concurrency = n;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let source = Arc::new(
    SqliteChangeLog::new(
      &config.source.path,
      Duration::from_millis(config.source.poll_interval_ms),
      config.source.batch_size,
    )
    .await?,
  );
  let queue = Arc::new(SqliteQueue::new(&config.queue.path, config.queue_settings()).await?);
  let checkpoint = Arc::new(SqliteCheckpoint::new(&config.checkpoint.path).await?);
  let store = Arc::new(SqliteProjection::new(&config.store.path).await?);

  let supervisor = Arc::new(Supervisor::new(
    source,
    queue,
    checkpoint,
    store,
    config.supervisor_config(),
  ));

  // Handle shutdown signals (SIGINT, SIGTERM)
  let drain = supervisor.clone();
  tokio::spawn(async move {
    shutdown_signal().await;
    drain.shutdown();
  });

  // Ok means a completed drain: exit 0. A startup failure or a lost
  // resume position bubbles up as Err and a non-zero exit.
  supervisor.run().await?;
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("Failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("Failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}

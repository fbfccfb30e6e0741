use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tillsync::api::{ApiClient, ApiRequest, HttpMethod};
use tillsync::cache::ReadThroughCache;
use tillsync::config::Config;
use tillsync::db::Database;
use tillsync::peripherals::Capabilities;
use tillsync::queue::{FlushReport, OperationQueue, OperationRecord};
use tillsync::sync::{self, SyncOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "tillsync")]
#[command(about = "Offline operation queue and sync for a point-of-sale client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tillsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue an operation for replay
  Enqueue {
    /// HTTP method (POST, PUT, PATCH, DELETE, GET)
    method: HttpMethod,
    /// Path relative to the API base URL, e.g. /orders
    path: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
    /// Extra header as NAME:VALUE, may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
  },
  /// Replay pending operations once
  Flush,
  /// Show queue counts and the last flush time
  Status,
  /// List operations parked as failed
  Failed,
  /// Discard a failed operation
  Ack { id: String },
  /// Move a failed operation back to pending
  Requeue { id: String },
  /// Inspect or refresh cached reference data
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Keep flushing on a timer and on reconnect until Ctrl-C
  Run,
  /// Report which subsystems are usable
  Capabilities,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get { key: String },
  /// Store a JSON value under a key
  Set { key: String, value: String },
  Delete { key: String },
  /// GET `path` from the API and cache it, falling back to the cached value offline
  Fetch { key: String, path: String },
}

fn parse_header(s: &str) -> std::result::Result<(String, String), String> {
  let (name, value) = s
    .split_once(':')
    .ok_or_else(|| format!("expected NAME:VALUE, got '{}'", s))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;

  let _log_guard = init_logging(db_path.parent());

  let db = Arc::new(
    Database::open(&db_path)
      .wrap_err_with(|| format!("Failed to open local store {}", db_path.display()))?,
  );

  match args.command {
    Command::Enqueue {
      method,
      path,
      body,
      headers,
    } => {
      let body = match body {
        Some(raw) => serde_json::from_str(&raw).wrap_err("--body is not valid JSON")?,
        None => Value::Null,
      };
      let queue = offline_queue(&config, db)?;
      let record = queue.enqueue(method, &path, body, headers.into_iter().collect())?;
      println!("{}", record.id);
      if let Some(key) = &record.idempotency_key {
        println!("idempotency key: {}", key);
      }
    }
    Command::Flush => {
      let queue = OperationQueue::new(db, api_client(&config)?, config.queue.retry_policy());
      print_report(&queue.flush().await?);
    }
    Command::Status => {
      let queue = offline_queue(&config, db)?;
      let counts = queue.counts()?;
      println!("device:   {}", queue.db().device_id()?);
      println!("pending:  {}", counts.pending);
      println!("failed:   {}", counts.failed);
      let sync = SyncOrchestrator::new(Arc::new(queue));
      match sync.last_flush_at()? {
        Some(at) => println!("last flush: {}", at.to_rfc3339()),
        None => println!("last flush: never"),
      }
    }
    Command::Failed => {
      let queue = offline_queue(&config, db)?;
      let failed = queue.failed()?;
      if failed.is_empty() {
        println!("no failed operations");
      }
      for record in &failed {
        print_record(record);
      }
    }
    Command::Ack { id } => {
      offline_queue(&config, db)?.acknowledge(&id)?;
      println!("acknowledged {}", id);
    }
    Command::Requeue { id } => {
      offline_queue(&config, db)?.requeue(&id)?;
      println!("requeued {}", id);
    }
    Command::Cache { command } => run_cache_command(&config, db, command).await?,
    Command::Run => run_sync_loop(&config, db).await?,
    Command::Capabilities => {
      let client = api_client(&config).ok();
      let probe = ApiRequest::get(config.sync.probe_path.clone());
      let caps = Capabilities::negotiate(&db, client.as_ref(), &probe, &config.printer).await;

      match &caps.store {
        Ok(counts) => println!("store:   ok ({} pending, {} failed)", counts.pending, counts.failed),
        Err(reason) => println!("store:   unavailable: {}", reason),
      }
      match &caps.remote {
        Ok(status) => println!("remote:  ok (HTTP {})", status.status),
        Err(reason) => println!("remote:  unavailable: {}", reason),
      }
      match &caps.printer {
        Ok(printer) => println!("printer: ok ({})", printer.kind()),
        Err(reason) => println!("printer: unavailable: {}", reason),
      }
    }
  }

  Ok(())
}

/// Daily rolling log file next to the database, plus stderr.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("TILLSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false);

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "tillsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .init();
  guard
}

fn api_client(config: &Config) -> Result<ApiClient> {
  let token = Config::get_api_token()?;
  Ok(ApiClient::new(&config.api, token)?)
}

/// Queue for commands that never talk to the remote. The client is still
/// built so enqueue works without a token.
fn offline_queue(config: &Config, db: Arc<Database>) -> Result<OperationQueue<ApiClient>> {
  let token = Config::get_api_token().unwrap_or_default();
  let client = ApiClient::new(&config.api, token)?;
  Ok(OperationQueue::new(db, client, config.queue.retry_policy()))
}

async fn run_cache_command(config: &Config, db: Arc<Database>, command: CacheCommand) -> Result<()> {
  let cache = ReadThroughCache::new(db);
  match command {
    CacheCommand::Get { key } => match cache.get(&key)? {
      Some(entry) => {
        println!("{}", serde_json::to_string_pretty(&entry.payload)?);
        eprintln!("cached at {}", entry.updated_at.to_rfc3339());
      }
      None => return Err(eyre!("nothing cached under '{}'", key)),
    },
    CacheCommand::Set { key, value } => {
      let payload: Value = serde_json::from_str(&value).wrap_err("value is not valid JSON")?;
      cache.set(&key, &payload)?;
    }
    CacheCommand::Delete { key } => {
      if !cache.delete(&key)? {
        return Err(eyre!("nothing cached under '{}'", key));
      }
    }
    CacheCommand::Fetch { key, path } => {
      let client = api_client(config)?;
      let result = cache
        .fetch_remote(&key, &client, &ApiRequest::get(path))
        .await?;
      println!("{}", serde_json::to_string_pretty(&result.data)?);
      if result.is_offline() {
        eprintln!("offline: showing data cached at {}", result.cached_at.to_rfc3339());
      }
    }
  }
  Ok(())
}

async fn run_sync_loop(config: &Config, db: Arc<Database>) -> Result<()> {
  let client = Arc::new(api_client(config)?);
  let queue = OperationQueue::new(db, Arc::clone(&client), config.queue.retry_policy());
  let orchestrator = SyncOrchestrator::new(Arc::new(queue));
  let (triggers, rx) = sync::trigger_channel();

  let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
  let watcher = {
    let client = Arc::clone(&client);
    let probe = ApiRequest::get(config.sync.probe_path.clone());
    let period = Duration::from_secs(config.sync.probe_interval_secs.max(1));
    let mut stop = stop_rx.clone();
    tokio::spawn(async move {
      sync::watch_connectivity(&client, probe, period, triggers, async move {
        let _ = stop.changed().await;
      })
      .await;
    })
  };

  let mut stop = stop_rx;
  let interval = Duration::from_secs(config.sync.interval_secs.max(1));
  let run = orchestrator.run(rx, interval, async move {
    let _ = stop.changed().await;
  });
  tokio::pin!(run);

  tokio::select! {
    _ = &mut run => {}
    result = tokio::signal::ctrl_c() => {
      result.wrap_err("Failed to listen for Ctrl-C")?;
      eprintln!("shutting down, finishing the current request");
      let _ = stop_tx.send(true);
      run.await;
    }
  }
  let _ = stop_tx.send(true);
  watcher.await?;

  let counts = orchestrator.queue().counts()?;
  if counts.pending > 0 {
    eprintln!("{} operations still pending, they will be sent on the next run", counts.pending);
  }
  Ok(())
}

fn print_report(report: &FlushReport) {
  println!(
    "processed {}, remaining {}, failed {}, deferred {}{}",
    report.processed,
    report.remaining,
    report.failed,
    report.deferred,
    if report.aborted { " (aborted)" } else { "" }
  );
}

fn print_record(record: &OperationRecord) {
  println!(
    "{}  {} {}  attempts={}  {}",
    record.id,
    record.method,
    record.path,
    record.attempts,
    record.last_error.as_deref().unwrap_or("-")
  );
}

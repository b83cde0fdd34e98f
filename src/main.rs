use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kwdata::config::Config;
use kwdata::sync::{NewTask, Priority, TaskKind};
use kwdata::transport::HttpTransport;
use kwdata::DataLayer;

#[derive(Parser, Debug)]
#[command(name = "kwdata")]
#[command(about = "Offline-first data layer for the keyword research API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/kwdata/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a resource through the cache
  Get { resource: String },

  /// Queue a mutation for the next sync
  Enqueue {
    #[arg(short, long)]
    kind: TaskKind,

    #[arg(short, long)]
    resource: String,

    /// JSON body
    #[arg(short, long)]
    payload: Option<String>,

    #[arg(long, default_value = "medium")]
    priority: Priority,
  },

  /// Dispatch every queued task that is due
  Sync,

  /// List tasks that failed permanently
  Failures {
    /// Empty the failure log afterwards
    #[arg(long)]
    clear: bool,
  },

  /// List configured invalidation rules
  Rules,
}

/// Log to `<data dir>/kwdata.log`; level from `KWDATA_LOG` (default info).
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = Config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&log_dir, "kwdata.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("KWDATA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let transport = Arc::new(HttpTransport::new(&config.transport)?);
  let layer = DataLayer::new(config, transport)?;

  match args.command {
    Command::Get { resource } => {
      let result = layer.get(&resource).await?;
      eprintln!("source: {:?}", result.source);
      if let Some(cached_at) = result.cached_at {
        eprintln!("cached at: {}", cached_at.to_rfc3339());
      }
      println!("{}", serde_json::to_string_pretty(&result.data)?);
    }

    Command::Enqueue {
      kind,
      resource,
      payload,
      priority,
    } => {
      if !layer.config().sync.persist {
        return Err(eyre!("Enqueue needs sync.persist enabled to keep the task"));
      }
      let mut task = NewTask::new(kind, resource).with_priority(priority);
      if let Some(payload) = payload {
        let payload = serde_json::from_str(&payload).map_err(|e| eyre!("Invalid payload JSON: {}", e))?;
        task = task.with_payload(payload);
      }

      // Stored only; `kwdata sync` dispatches it
      layer.queue().set_online(false);
      let id = layer.queue().add_task(task);
      info!(task_id = %id, "Task queued from command line");
      println!("{}", id);
    }

    Command::Sync => {
      let queue = layer.queue();
      queue.set_online(false);
      let restored = queue.restore();
      let dispatched = queue.flush().await;

      let stats = queue.stats();
      println!(
        "restored {}, dispatched {}, pending {}, failed {}",
        restored, dispatched, stats.pending, stats.failed
      );
      for (priority, count) in &stats.by_priority {
        println!("  {:<8} {}", priority, count);
      }
    }

    Command::Failures { clear } => {
      let queue = layer.queue();
      queue.set_online(false);
      queue.restore();

      let failures = queue.failures();
      if failures.is_empty() {
        println!("No failed tasks");
      }
      for failed in &failures {
        println!(
          "{}  {} {}  attempts={}  {}",
          failed.failed_at.to_rfc3339(),
          failed.task.kind,
          failed.task.target_resource,
          failed.task.attempt,
          failed.error
        );
      }
      if clear {
        queue.clear_failures();
        println!("Cleared {} failed tasks", failures.len());
      }
    }

    Command::Rules => {
      for rule in layer.graph().rules() {
        let mut triggers: Vec<String> = rule.triggers.iter().map(|t| t.to_string()).collect();
        triggers.sort();
        println!("{}  /{}/", rule.name, rule.key_pattern);
        println!("  triggers:   {}", triggers.join(", "));
        if !rule.depends_on.is_empty() {
          println!("  depends on: {}", rule.depends_on.join(", "));
        }
      }
    }
  }

  Ok(())
}

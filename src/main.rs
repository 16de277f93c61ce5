use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use modelsync::cache::CacheManager;
use modelsync::config::Config;
use modelsync::db::Database;
use modelsync::sync::{Model, SyncMethod, SyncOptions, Syncable};
use modelsync::SyncEngine;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "modelsync")]
#[command(about = "Sync models with REST backends through a TTL cache and offline mirror")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/modelsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Inspect or maintain the key-value cache
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Run one sync against a configured model
  Sync {
    /// create, read, update, delete or patch
    method: String,
    /// Model name from the adapters section
    model: String,
    /// Model id; reads without one fetch the collection
    #[arg(long)]
    id: Option<String>,
    /// Model attributes as a JSON object
    #[arg(long)]
    data: Option<String>,
    /// Send an update as PATCH with only these attributes
    #[arg(long = "patch")]
    patch: Vec<String>,
    /// Query parameter as key=value
    #[arg(long = "query")]
    query: Vec<String>,
    /// Serve reads from cache for this many seconds
    #[arg(long)]
    ttl: Option<u64>,
    /// Rewrite PUT/PATCH/DELETE as POST with a method override header
    #[arg(long)]
    emulate_http: bool,
  },

  /// Replay pending offline changes and refresh the mirror
  Fullsync {
    /// Model name; every offline model when omitted
    model: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get {
    key: String,
  },
  Set {
    key: String,
    value: String,
    /// Seconds until expiry; never expires when omitted
    #[arg(long)]
    ttl: Option<u64>,
    /// Metadata stored with the entry, as JSON
    #[arg(long)]
    info: Option<String>,
  },
  Remove {
    key: String,
  },
  /// Drop every entry
  Purge,
  /// Drop expired entries
  Prune,
  /// Storage footprint in bytes
  Size,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging()?;

  let args = Args::parse();
  let config = load_config(args.config)?;

  match args.command {
    Command::Cache(command) => run_cache(&config, command),
    Command::Sync {
      method,
      model,
      id,
      data,
      patch,
      query,
      ttl,
      emulate_http,
    } => {
      let engine = SyncEngine::from_config(config)?;
      let method: SyncMethod = method.parse().map_err(|e: String| eyre!(e))?;

      let mut opts = SyncOptions::new();
      if !patch.is_empty() {
        opts = opts.patch(patch);
      }
      for pair in query {
        let (key, value) = pair
          .split_once('=')
          .ok_or_else(|| eyre!("Query parameter must be key=value: {}", pair))?;
        opts = opts.param(key, value);
      }
      if let Some(ttl) = ttl {
        opts = opts.ttl(ttl);
      }
      if emulate_http {
        opts = opts.emulate_http(true);
      }

      let response = match (method, id) {
        (SyncMethod::Read, None) => {
          let collection = engine.collection(&model)?;
          engine.sync(method, &collection, &opts).await?
        }
        (_, id) => {
          let target = build_model(engine.model(&model)?, data.as_deref(), id)?;
          engine.sync(method, &target, &opts).await?
        }
      };
      print_json(&serde_json::to_value(&response)?)
    }
    Command::Fullsync { model } => {
      let engine = SyncEngine::from_config(config)?;
      let results = match model {
        Some(name) => {
          let result = engine.fullsync(&name).await;
          vec![(name, result)]
        }
        None => engine.fullsync_all().await,
      };

      let mut failed = 0;
      for (name, result) in results {
        match result {
          Ok(response) => println!("{}: {} records", name, count(&response.payload)),
          Err(e) => {
            failed += 1;
            eprintln!("{}: {}", name, e);
          }
        }
      }
      if failed > 0 {
        return Err(eyre!("{} fullsync(s) failed", failed));
      }
      Ok(())
    }
  }
}

fn init_logging() -> Result<WorkerGuard> {
  let dir = Database::default_dir()?.join("logs");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "modelsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("MODELSYNC_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false),
    )
    .init();

  Ok(guard)
}

/// Explicit paths must load; otherwise fall back to defaults when no file exists.
fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
  match Config::load(explicit.as_deref()) {
    Ok(config) => Ok(config),
    Err(e) if explicit.is_none() => {
      warn!(error = %e, "using default configuration");
      Ok(Config::default())
    }
    Err(e) => Err(e),
  }
}

fn run_cache(config: &Config, command: CacheCommand) -> Result<()> {
  let cache = CacheManager::from_config(&config.cache)?;
  info!(driver = %cache.kind(), "cache command");

  match command {
    CacheCommand::Get { key } => match cache.get(&key)? {
      Some(entry) => print_json(&json!({
        "value": String::from_utf8_lossy(&entry.value),
        "expire": entry.expire.to_raw(),
        "info": entry.info,
      })),
      None => Err(eyre!("No live entry for key: {}", key)),
    },
    CacheCommand::Set {
      key,
      value,
      ttl,
      info,
    } => {
      let info = match info {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| eyre!("Invalid --info JSON: {}", e))?,
        None => Value::Null,
      };
      cache.set(&key, value.as_bytes(), ttl, info)
    }
    CacheCommand::Remove { key } => cache.remove(&key),
    CacheCommand::Purge => cache.purge(),
    CacheCommand::Prune => {
      println!("{}", cache.prune()?);
      Ok(())
    }
    CacheCommand::Size => {
      println!("{}", cache.size()?);
      Ok(())
    }
  }
}

fn build_model(model: Model, data: Option<&str>, id: Option<String>) -> Result<Model> {
  let attributes = match data {
    Some(raw) => serde_json::from_str(raw).map_err(|e| eyre!("Invalid --data JSON: {}", e))?,
    None => json!({}),
  };
  let mut model = model.with_attributes(attributes);

  if let Some(id) = id {
    // Numeric ids stay numbers so they round-trip unchanged
    let value = id.parse::<i64>().map(Value::from).unwrap_or(Value::String(id));
    let attr = model.descriptor().id_attribute.clone();
    model.set(attr, value);
  }
  Ok(model)
}

fn count(payload: &Value) -> usize {
  payload.as_array().map(Vec::len).unwrap_or(0)
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

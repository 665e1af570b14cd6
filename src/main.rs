use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tillcache::cache::{
  age_display, Cacheable, DurableStore, NoopStorage, SmartCache, SqliteStorage,
};
use tillcache::catalog::{Catalog, Collection};
use tillcache::config::Config;
use tillcache::datastore::DataStore;
use tillcache::errlog::LogFilter;
use tillcache::network::NetworkMonitor;
use tillcache::preload::PreloadOrchestrator;
use tillcache::query::{AttendanceFilter, CollectionQuery, Hooks};
use tillcache::source::RestSource;
use tillcache::FetchOptions;

#[derive(Parser, Debug)]
#[command(name = "tillcache")]
#[command(about = "Inspect and warm the point-of-sale collection cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tillcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Branch to scope branch-partitioned collections to
  #[arg(short, long, global = true)]
  branch: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show per-collection freshness and durable store usage
  Stats {
    /// Print as JSON
    #[arg(long)]
    json: bool,
  },
  /// Read one collection through the cache
  Fetch {
    #[arg(value_enum)]
    collection: Collection,
    /// Skip every cached tier
    #[arg(long)]
    force: bool,
  },
  /// Read one collection through the per-entity query tiers
  Query {
    #[arg(value_enum)]
    collection: Collection,
    /// Attendance: only this employee
    #[arg(long)]
    employee: Option<String>,
    /// Attendance: only the last N days
    #[arg(long)]
    last_days: Option<u32>,
    /// Payment methods: only active ones
    #[arg(long)]
    active_only: bool,
  },
  /// Warm every preloaded collection for the branch
  Preload,
  /// Mark one cache key for refresh and drop its persisted copy
  Invalidate { key: String },
  /// Drop all cached data
  Clear,
}

/// Log to stderr and to a daily file in the data directory.
fn init_tracing() -> Option<WorkerGuard> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let log_dir = dirs::data_dir().map(|dir| dir.join("tillcache").join("logs"));
  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        dir,
        "tillcache.log",
      ));
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  guard
}

fn open_store(config: &Config) -> Result<Arc<dyn DurableStore>> {
  if !config.store.enabled {
    return Ok(Arc::new(NoopStorage));
  }
  let limits = config.store_limits();
  let store = match &config.store.path {
    Some(path) => SqliteStorage::open(path, limits)?,
    None => SqliteStorage::open_default(limits)?,
  };
  Ok(Arc::new(store))
}

fn rest_source(config: &Config) -> Result<RestSource> {
  RestSource::new(&config.remote, Config::get_api_key()?)
}

fn catalog(config: &Config, cache: SmartCache) -> Result<Catalog<RestSource>> {
  Ok(Catalog::new(rest_source(config)?, cache))
}

/// Run `query` to completion and count the rows it ends up showing.
async fn count_rows<T: Cacheable>(mut query: CollectionQuery<T>) -> Result<usize> {
  query.fetch();
  query.settle().await;
  if let Some(message) = query.error() {
    return Err(eyre!("{}: {}", query.key(), message));
  }
  Ok(query.data().map_or(0, |rows| rows.len()))
}

async fn run_query(
  hooks: &Hooks<RestSource>,
  collection: Collection,
  branch: Option<&str>,
  attendance: AttendanceFilter,
  active_only: bool,
) -> Result<usize> {
  match collection {
    Collection::Customers => count_rows(hooks.customers(branch)).await,
    Collection::Employees => count_rows(hooks.employees(branch)).await,
    Collection::Products => count_rows(hooks.products(branch)).await,
    Collection::Variants => count_rows(hooks.parent_variants(branch)).await,
    Collection::PaymentMethods => count_rows(hooks.payment_methods(active_only)).await,
    Collection::Attendance => count_rows(hooks.attendance(branch, attendance)).await,
    other => Err(eyre!("{} has no per-entity query, use `fetch`", other)),
  }
}

async fn print_stats(cache: &SmartCache, json: bool) -> Result<()> {
  let stats = cache.get_cache_stats().await;
  if json {
    println!("{}", serde_json::to_string_pretty(&stats)?);
    return Ok(());
  }

  println!("{:<32} {:>7} {:<8} {:<10} FLAGS", "KEY", "ITEMS", "STATUS", "AGE");
  for (key, entry) in &stats.keys {
    let freshness = if entry.is_fresh {
      "fresh"
    } else if entry.is_stale {
      "stale"
    } else {
      "expired"
    };
    let age = entry.age.map(age_display).unwrap_or_else(|| "-".to_string());
    let mut flags = vec![freshness];
    if entry.memory_only {
      flags.push("memory-only");
    }
    if !entry.resident {
      flags.push("on-disk");
    }
    println!(
      "{:<32} {:>7} {:<8} {:<10} {}",
      key,
      entry.item_count,
      entry.status,
      age,
      flags.join(",")
    );
  }
  println!(
    "\n{} collections persisted, {} bytes",
    stats.store.total_keys, stats.store.total_bytes
  );
  Ok(())
}

fn print_errors(cache: &SmartCache) {
  let records = cache.error_log().recent(&LogFilter {
    unresolved_only: true,
    limit: Some(20),
    ..LogFilter::default()
  });
  for record in records {
    eprintln!(
      "[{:?}/{:?}] {}::{} {} {}",
      record.severity,
      record.error_type,
      record.site.module,
      record.site.function,
      record.key.as_deref().unwrap_or("-"),
      record.message
    );
  }
}

async fn run(
  config: Config,
  branch: Option<String>,
  command: Command,
  config_path: Option<&Path>,
) -> Result<()> {
  let network = NetworkMonitor::new();
  let cache = SmartCache::with_settings(
    open_store(&config)?,
    config.cache_settings(network.clone()),
  );
  info!(config = ?config_path, branch = ?branch, "Cache ready");

  match command {
    Command::Stats { json } => print_stats(&cache, json).await?,
    Command::Fetch { collection, force } => {
      let catalog = catalog(&config, cache.clone())?;
      let options = if force {
        FetchOptions::force()
      } else {
        FetchOptions::default()
      };
      let result = catalog.refresh(collection, branch.as_deref(), options).await;
      cache.flush().await;
      match result {
        Ok(count) => println!("{}: {} rows", collection.key(branch.as_deref()), count),
        Err(err) => {
          print_errors(&cache);
          return Err(eyre!("{}", err.user_message()));
        }
      }
    }
    Command::Query {
      collection,
      employee,
      last_days,
      active_only,
    } => {
      let ctx = config.query_context(DataStore::new(), network);
      let hooks = Hooks::new(ctx, rest_source(&config)?);
      let attendance = AttendanceFilter {
        employee_id: employee,
        last_days,
      };
      let count = run_query(&hooks, collection, branch.as_deref(), attendance, active_only).await?;
      println!("{}: {} rows", collection.key(branch.as_deref()), count);
    }
    Command::Preload => {
      let catalog = catalog(&config, cache.clone())?;
      let preload = PreloadOrchestrator::new(catalog, DataStore::new(), config.preload_settings());
      let report = preload.start(branch).await;
      cache.flush().await;
      println!(
        "loaded {} ({} from cache), failed {} in {}ms",
        report.loaded.len(),
        report.from_cache.len(),
        report.failed.len(),
        report.duration.as_millis()
      );
      for (collection, message) in &report.errors {
        println!("  {}: {}", collection, message);
      }
      if !report.success() {
        print_errors(&cache);
      }
    }
    Command::Invalidate { key } => {
      cache.invalidate_cache(key.as_str());
      cache.flush().await;
      println!("invalidated {}", key);
    }
    Command::Clear => {
      cache.clear_all_cache();
      cache.flush().await;
      println!("cache cleared");
    }
  }

  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing();

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Command line branch overrides the configured default
  let branch = args.branch.or_else(|| config.default_branch.clone());

  run(config, branch, args.command, args.config.as_deref()).await
}

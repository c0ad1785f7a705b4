mod catalog;
mod config;
mod contract_items;
mod engine;
mod esi;
mod expiry;
mod owner;
mod registry;
mod store;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::catalog::{Catalog, Services};
use crate::config::Config;
use crate::esi::EsiClient;
use crate::expiry::ExpiryRegistry;
use crate::owner::{OwnerDirectory, OwnerKind, StaticDirectory};
use crate::registry::StoreRegistry;
use crate::store::{Backend, KeyValueStore, MemoryStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "esi-mirror")]
#[command(about = "Keeps a deduplicated local mirror of EVE Online ESI data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/esi-mirror/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the daily log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch everything that has expired
  Sync {
    /// Refetch every owner regardless of expiry
    #[arg(long)]
    force: bool,
  },
  /// Sync, then keep sweeping expired data until interrupted
  Watch,
  /// Show stored records per store and owner
  Status,
  /// Refresh one owner now, regardless of expiry
  Refresh {
    /// character or corporation
    kind: String,
    id: i64,
    /// Only endpoints containing this text (e.g. /contracts/)
    #[arg(long)]
    endpoint: Option<String>,
  },
  /// Remove an owner's data from every store
  RemoveOwner {
    /// character or corporation
    kind: String,
    id: i64,
  },
  /// Clear the named stores, or everything when no names are given
  Clear { names: Vec<String> },
  /// Reload and force-refetch the named stores
  Refetch {
    #[arg(required = true)]
    names: Vec<String>,
  },
}

fn setup_tracing(log_stderr: bool) -> Result<Option<WorkerGuard>> {
  use tracing_subscriber::prelude::*;
  use tracing_subscriber::EnvFilter;

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esi_mirror=info"));

  if log_stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("esi-mirror")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "esi-mirror.log"));
  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(Some(guard))
}

fn open_store(config: &Config) -> Result<Backend> {
  if !config.cache.enabled {
    info!("Cache disabled, keeping data in memory");
    return Ok(Backend::Memory(MemoryStore::new()));
  }
  Ok(Backend::Sqlite(SqliteStore::open(config.cache.path.as_deref())?))
}

/// Fail with the stores named in `failed`, if any.
fn check(operation: &str, failed: Vec<String>) -> Result<()> {
  if failed.is_empty() {
    Ok(())
  } else {
    Err(eyre!("{} failed for: {}", operation, failed.join(", ")))
  }
}

fn check_names(registry: &StoreRegistry, names: &[String]) -> Result<()> {
  let known = registry.names();
  for name in names {
    if !known.contains(name) {
      return Err(eyre!(
        "Unknown store '{}'. Known stores: {}",
        name,
        known.join(", ")
      ));
    }
  }
  Ok(())
}

async fn sync<S: KeyValueStore + 'static>(
  catalog: &Catalog<S>,
  registry: &StoreRegistry,
  force: bool,
) -> Vec<String> {
  catalog.backfill_contract_items();
  let failed = registry.update_all(force).await;
  if let Err(e) = catalog.prune_contract_items() {
    warn!(error = %e, "Failed to prune contract items");
  }
  failed
}

fn print_status<S: KeyValueStore + 'static>(
  services: &Services<S>,
  catalog: &Catalog<S>,
  registry: &StoreRegistry,
) {
  println!("{:<24} {:>8}", "STORE", "RECORDS");
  for name in registry.names() {
    if let Some(store) = registry.get(&name) {
      let failed = store.failed_owners();
      if failed.is_empty() {
        println!("{:<24} {:>8}", name, store.record_count());
      } else {
        println!(
          "{:<24} {:>8}  failed: {}",
          name,
          store.record_count(),
          failed.join(", ")
        );
      }
    }
  }
  if registry.is_any_updating() {
    println!("(contract items still fetching, counts may change)");
  }

  let counts = catalog.visibility_counts();
  let now = chrono::Utc::now();
  for owner in services.directory.list_owners() {
    let key = owner.key();
    let marker = if owner.auth_failed {
      "  [no usable token]"
    } else {
      ""
    };
    println!("\n{} ({}){}", key, owner.name, marker);

    for (engine, per_owner) in &counts {
      if let Some(count) = per_owner.get(&key) {
        println!("  {:<24} {:>6} visible", engine, count);
      }
    }
    for endpoint in services.expiry.endpoints_for(&key) {
      if let Some(record) = services.expiry.get(&key, &endpoint) {
        let state = if record.is_expired_at(now) {
          "expired".to_string()
        } else {
          format!("fresh until {}", record.expires_at.format("%H:%M:%S"))
        };
        println!("  {:<40} {}", endpoint, state);
      }
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = setup_tracing(args.log_stderr)?;

  let config = Config::load(args.config.as_deref())?;

  let store = Arc::new(open_store(&config)?);
  let expiry = Arc::new(ExpiryRegistry::new(store.clone()));
  expiry.load();

  let directory: Arc<dyn OwnerDirectory> = Arc::new(StaticDirectory::from_config(&config.owners));
  let esi = EsiClient::new(&config.esi, directory.clone())?;
  let services = Services {
    store,
    expiry,
    directory,
    esi,
  };

  let mut catalog = Catalog::build(&services, &config.sync)?;
  let registry = StoreRegistry::new();
  catalog.register_all(&registry);

  check("Initialization", registry.init_all(&[]).await)?;

  match args.command {
    Command::Sync { force } => {
      let failed = sync(&catalog, &registry, force).await;
      print_status(&services, &catalog, &registry);
      check("Sync", failed)?;
    }

    Command::Watch => {
      let failed = sync(&catalog, &registry, false).await;
      if !failed.is_empty() {
        warn!(stores = ?failed, "Initial sync incomplete");
      }

      let mut sweep = tokio::time::interval(Duration::from_secs(config.sync.sweep_interval_secs));
      sweep.tick().await;
      let shutdown = tokio::signal::ctrl_c();
      tokio::pin!(shutdown);

      info!(interval_secs = config.sync.sweep_interval_secs, "Watching");
      loop {
        tokio::select! {
          _ = sweep.tick() => {
            let refreshed = services.expiry.refresh_expired().await;
            // Picks up owners that have never been fetched.
            let failed = sync(&catalog, &registry, false).await;
            debug!(refreshed, failed = failed.len(), "Sweep finished");
          }
          _ = &mut shutdown => {
            info!("Interrupted, stopping");
            break;
          }
        }
      }
      catalog.unbind_refresh();
    }

    Command::Status => print_status(&services, &catalog, &registry),

    Command::Refresh { kind, id, endpoint } => {
      let key = owner::owner_key(kind.parse()?, id);
      let refreshed = services
        .expiry
        .trigger_refresh(&key, endpoint.as_deref())
        .await;
      if refreshed == 0 {
        return Err(eyre!(
          "Nothing to refresh for {}. Run sync first to record its endpoints.",
          key
        ));
      }
      registry.update_all(false).await;
      if let Err(e) = catalog.prune_contract_items() {
        warn!(error = %e, "Failed to prune contract items");
      }
      print_status(&services, &catalog, &registry);
    }

    Command::RemoveOwner { kind, id } => {
      let kind: OwnerKind = kind.parse()?;
      let failed = registry.remove_for_owner_all(kind, id).await;
      catalog.prune_contract_items()?;
      check("Owner removal", failed)?;
      println!("Removed {}-{}", kind, id);
    }

    Command::Clear { names } => {
      if names.is_empty() {
        let failed = registry.clear_all().await;
        services.expiry.clear()?;
        check("Clear", failed)?;
        println!("Cleared all stores");
      } else {
        check_names(&registry, &names)?;
        check("Clear", registry.clear_by_names(&names).await)?;
        println!("Cleared {}", names.join(", "));
      }
    }

    Command::Refetch { names } => {
      check_names(&registry, &names)?;
      let failed = registry.refetch_by_names(&names).await;
      if let Err(e) = catalog.prune_contract_items() {
        warn!(error = %e, "Failed to prune contract items");
      }
      print_status(&services, &catalog, &registry);
      check("Refetch", failed)?;
    }
  }

  Ok(())
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shroud_core::audit::{AuditLog, AuditSink};
use shroud_core::config::{KeyStoreKind, ShroudConfig};
use shroud_core::keys::{open_key, validate_key_id, FileKeyStore, KeyStore, KeyringKeyStore};
use shroud_core::paths;
use shroud_core::policy::{Direction, Mode, Trigger, WatchPolicy};
use shroud_core::token::TransformKey;
use shroud_service::{Monitor, StatusCallback, TransformHandler};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MASTER_KEY_ID: &str = "master_key";

#[derive(Parser, Debug)]
#[command(author, version, about = "Shroud: keeps watched directories encrypted", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default configuration and create the master key
    Init,
    /// Generate a new named key
    Keygen {
        id: String,
        /// Store the key in the OS credential store regardless of configuration
        #[arg(long)]
        force_keyring: bool,
    },
    /// Run every configured watch until Ctrl-C
    Run,
    /// Watch a single directory until Ctrl-C
    Watch {
        dir: PathBuf,
        #[arg(long, default_value = "encrypt")]
        direction: Direction,
        #[arg(long, default_value = "create")]
        trigger: Trigger,
        #[arg(long, default_value = "individual")]
        mode: Mode,
        /// Group substring (repeatable), used with --mode group
        #[arg(long = "group")]
        groups: Vec<String>,
        #[arg(long, default_value = MASTER_KEY_ID)]
        key: String,
    },
    /// Transform every eligible file under a directory once
    Sweep {
        dir: PathBuf,
        #[arg(long, default_value = "encrypt")]
        direction: Direction,
        #[arg(long, default_value = MASTER_KEY_ID)]
        key: String,
    },
    /// Show recent audit events
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Check the hash chain instead of listing events
        #[arg(long)]
        verify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => paths::config_path()?,
    };
    let config = ShroudConfig::load(&config_path)?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Init => init_command(&config_path, &config),
        Commands::Keygen { id, force_keyring } => keygen_command(&config, &id, force_keyring),
        Commands::Run => run_command(&config).await,
        Commands::Watch {
            dir,
            direction,
            trigger,
            mode,
            groups,
            key,
        } => {
            let policy = WatchPolicy::new(dir)
                .with_trigger(trigger)
                .with_mode(mode)
                .with_groups(groups)
                .with_max_file_size(config.max_file_size_bytes())
                .with_allowed_extensions(&config.allowed_extensions);
            watch_command(&config, policy, direction, &key).await
        }
        Commands::Sweep {
            dir,
            direction,
            key,
        } => sweep_command(&config, &dir, direction, &key),
        Commands::Audit { limit, verify } => audit_command(&config, limit, verify),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn init_command(config_path: &Path, config: &ShroudConfig) -> Result<()> {
    if config_path.exists() {
        println!("Config already present: {}", config_path.display());
    } else {
        config.save(config_path)?;
        println!("Wrote default config: {}", config_path.display());
    }
    fs::create_dir_all(paths::log_dir()?)?;
    if config.key_store == KeyStoreKind::File {
        fs::create_dir_all(config.key_dir()?)?;
    }

    let audit = open_audit(config)?;
    let store = key_store(config)?;
    let (_, created) = open_key(store.as_ref(), MASTER_KEY_ID, true)?;
    if created {
        audit.record(
            "key_generated",
            json!({ "key_id": MASTER_KEY_ID, "store": store_name(config.key_store) }),
        );
        println!("Generated key '{MASTER_KEY_ID}'");
    } else {
        println!("Key '{MASTER_KEY_ID}' already present");
    }
    Ok(())
}

fn keygen_command(config: &ShroudConfig, id: &str, force_keyring: bool) -> Result<()> {
    validate_key_id(id)?;
    let kind = if force_keyring {
        KeyStoreKind::Keyring
    } else {
        config.key_store
    };
    let store = store_of_kind(config, kind)?;
    if store.contains(id)? {
        bail!("key '{id}' already exists; refusing to overwrite");
    }
    store.generate_key(id)?;
    open_audit(config)?.record(
        "key_generated",
        json!({ "key_id": id, "store": store_name(kind) }),
    );
    println!("Generated key '{id}' in the {} store", store_name(kind));
    Ok(())
}

async fn run_command(config: &ShroudConfig) -> Result<()> {
    if config.watches.is_empty() {
        bail!("no watches configured; add entries under \"watches\" or use `shroud watch`");
    }
    let audit = open_audit(config)?;
    let store = key_store(config)?;
    let monitor = Monitor::new(audit.clone(), Some(status_printer()));

    for watch in &config.watches {
        let started = load_key(store.as_ref(), &watch.key, config.key_store, audit.as_ref())
            .and_then(|key| monitor.start(watch.to_policy(config), watch.direction, key));
        if let Err(e) = started {
            monitor.stop_all().await;
            return Err(e.context(format!("start watch {}", watch.path.display())));
        }
    }
    info!(sessions = monitor.sessions().len(), "service started");

    wait_for_shutdown().await?;
    report_sessions(&monitor);
    monitor.stop_all().await;
    Ok(())
}

async fn watch_command(
    config: &ShroudConfig,
    policy: WatchPolicy,
    direction: Direction,
    key_id: &str,
) -> Result<()> {
    let audit = open_audit(config)?;
    let store = key_store(config)?;
    let key = load_key(store.as_ref(), key_id, config.key_store, audit.as_ref())?;
    let monitor = Monitor::new(audit, Some(status_printer()));
    let id = monitor.start(policy, direction, key)?;

    wait_for_shutdown().await?;
    report_sessions(&monitor);
    monitor.stop(id).await
}

fn sweep_command(config: &ShroudConfig, dir: &Path, direction: Direction, key_id: &str) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let root = dir
        .canonicalize()
        .with_context(|| format!("resolve {}", dir.display()))?;
    let audit = open_audit(config)?;
    let store = key_store(config)?;
    let key = load_key(store.as_ref(), key_id, config.key_store, audit.as_ref())?;
    let policy = WatchPolicy::new(root)
        .with_mode(Mode::All)
        .with_max_file_size(config.max_file_size_bytes())
        .with_allowed_extensions(&config.allowed_extensions);
    let handler = TransformHandler::new(policy, direction, key, audit, Some(status_printer()));

    let report = handler.sweep();
    println!(
        "{} transformed, {} skipped, {} failed",
        report.transformed.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for (path, cause) in &report.failed {
        println!("  failed: {}: {cause}", path.display());
    }
    if !report.failed.is_empty() {
        bail!("{} file(s) could not be transformed", report.failed.len());
    }
    Ok(())
}

fn audit_command(config: &ShroudConfig, limit: usize, verify: bool) -> Result<()> {
    let log = AuditLog::open(config.audit_log_path()?, config.audit_max_bytes)?;
    if verify {
        return match log.verify_chain()? {
            None => {
                println!("Audit chain intact: {}", log.path().display());
                Ok(())
            }
            Some(broken) => bail!("audit chain broken at seq {}: {}", broken.seq, broken.reason),
        };
    }
    for event in log.read_recent(None, Some(limit))? {
        println!(
            "{:>6}  {}  {:<20} {}",
            event.seq,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.details
        );
    }
    Ok(())
}

fn open_audit(config: &ShroudConfig) -> Result<Arc<AuditLog>> {
    let path = config.audit_log_path()?;
    let log = AuditLog::open(&path, config.audit_max_bytes)
        .with_context(|| format!("open audit log {}", path.display()))?;
    Ok(Arc::new(log))
}

fn key_store(config: &ShroudConfig) -> Result<Box<dyn KeyStore>> {
    store_of_kind(config, config.key_store)
}

fn store_of_kind(config: &ShroudConfig, kind: KeyStoreKind) -> Result<Box<dyn KeyStore>> {
    Ok(match kind {
        KeyStoreKind::File => Box::new(FileKeyStore::new(config.key_dir()?)),
        KeyStoreKind::Keyring => Box::new(KeyringKeyStore),
    })
}

fn store_name(kind: KeyStoreKind) -> &'static str {
    match kind {
        KeyStoreKind::File => "file",
        KeyStoreKind::Keyring => "keyring",
    }
}

fn load_key(
    store: &dyn KeyStore,
    id: &str,
    kind: KeyStoreKind,
    audit: &dyn AuditSink,
) -> Result<TransformKey> {
    let (key, _) = open_key(store, id, false)
        .with_context(|| format!("load key '{id}' (create it with `shroud keygen {id}`)"))?;
    audit.record(
        "key_loaded",
        json!({ "key_id": id, "store": store_name(kind) }),
    );
    Ok(key)
}

fn status_printer() -> StatusCallback {
    Arc::new(|message: &str| println!("{message}"))
}

async fn wait_for_shutdown() -> Result<()> {
    info!("press Ctrl-C to stop");
    signal::ctrl_c().await.context("listen for Ctrl-C")?;
    info!("shutting down");
    Ok(())
}

fn report_sessions(monitor: &Monitor) {
    for session in monitor.sessions() {
        info!(
            id = %session.id,
            root = %session.root.display(),
            direction = %session.direction,
            processed = session.files_processed,
            "session summary"
        );
    }
}

//! rust_ics - instrument control services
//!
//! # Usage
//!
//! ```bash
//! # Shared cache server
//! rust_ics --config config/rust_ics.toml cache
//!
//! # Poller supervisor (one child per active setup)
//! rust_ics poller
//!
//! # Single-setup poller, normally started by the supervisor
//! rust_ics poller --setup optics
//!
//! # Script daemon with two setups loaded
//! rust_ics daemon --setup optics --setup detector
//!
//! # Debug logging
//! RUST_LOG=rust_ics=debug rust_ics daemon
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rust_ics::cache::{Cache, CacheClient, CacheServer, CacheStore};
use rust_ics::clock;
use rust_ics::config::{Settings, DEFAULT_CONFIG_PATH};
use rust_ics::context::{Context, Mode};
use rust_ics::daemon::{Authenticator, DaemonServer, DaemonSession};
use rust_ics::logging::{self, LogFormat};
use rust_ics::poller::{PollerSupervisor, ProcessLauncher, SetupPoller};

/// Instrument control services
#[derive(Parser, Debug)]
#[command(name = "rust_ics", version, about)]
struct Args {
    /// Configuration file (defaults to config/rust_ics.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache server
    Cache,
    /// Run the poller supervisor, or a single setup's poller with --setup
    Poller {
        #[arg(long)]
        setup: Option<String>,
    },
    /// Run the script daemon
    Daemon {
        /// Setups to load at startup
        #[arg(long)]
        setup: Vec<String>,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None if PathBuf::from(DEFAULT_CONFIG_PATH).exists() => Settings::load_from(DEFAULT_CONFIG_PATH)?,
        None => Settings::load()?,
    };
    settings.validate()?;
    Ok(settings)
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    error!(error = %err, "cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested");
        token.cancel();
    });
}

async fn cache_client(settings: &Settings, name: &str) -> Arc<dyn Cache> {
    Arc::new(CacheClient::connect(settings.cache_address(), name, &settings.cache).await)
}

async fn run_cache(settings: Settings) -> Result<()> {
    let store = match &settings.cache.store_dir {
        Some(dir) => CacheStore::open(dir)
            .with_context(|| format!("Failed to open cache store at {}", dir.display()))?,
        None => CacheStore::new(),
    }
    .with_lock_ttl(settings.cache.lock_ttl_s);
    let server = CacheServer::bind(&settings.cache_address(), Arc::new(store)).await?;
    spawn_signal_handler(server.shutdown_token());
    server.run().await?;
    Ok(())
}

async fn run_setup_poller(settings: Settings, setup: String) -> Result<()> {
    let settings = Arc::new(settings);
    let cache = cache_client(&settings, &format!("poller-{}", setup)).await;
    let ctx = Context::builder(Arc::clone(&settings))
        .cache(cache)
        .mode(Mode::Slave)
        .build();
    let mut poller = SetupPoller::new(ctx, setup);
    spawn_signal_handler(poller.shutdown_token());
    let workers = poller.start()?;
    info!(setup = %poller.setup(), workers, "poller running");
    poller.wait().await;
    Ok(())
}

async fn run_supervisor(settings: Settings, config: Option<PathBuf>) -> Result<()> {
    let settings = Arc::new(settings);
    let cache = cache_client(&settings, "poller").await;
    let launcher = Arc::new(ProcessLauncher::current_exe(config)?);
    let supervisor = PollerSupervisor::new(settings, cache, launcher);
    spawn_signal_handler(supervisor.shutdown_token());
    supervisor.run().await?;
    Ok(())
}

async fn run_daemon(settings: Settings, setups: Vec<String>) -> Result<()> {
    let settings = Arc::new(settings);
    let cache = cache_client(&settings, "daemon").await;
    let ctx = Context::builder(Arc::clone(&settings))
        .cache(Arc::clone(&cache))
        .mode(Mode::Master)
        .build();
    for setup in &setups {
        let devices = ctx.load_setup(setup).await?;
        info!(%setup, devices = devices.len(), "setup loaded");
    }
    let master_key = format!("{}/mastersetup", settings.application.session);
    cache.put(&master_key, json!(setups), clock::now(), None).await?;

    let session = DaemonSession::new(Arc::clone(&ctx));
    let auth = Authenticator::from_config(&settings.daemon);
    let server = DaemonServer::bind(&settings.daemon_address(), Arc::clone(&session), auth).await?;
    let shutdown = server.shutdown_token();
    let session_stop = session.shutdown_token();
    spawn_signal_handler(shutdown.clone());

    let runner = tokio::spawn(Arc::clone(&session).run());
    server.run().await?;
    session_stop.cancel();
    if let Err(err) = runner.await {
        error!(error = %err, "script loop ended abnormally");
    }
    ctx.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(args.config.as_ref())?;
    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(&settings.application.log_level, format);

    match args.command {
        Command::Cache => run_cache(settings).await,
        Command::Poller { setup: Some(setup) } => run_setup_poller(settings, setup).await,
        Command::Poller { setup: None } => run_supervisor(settings, args.config).await,
        Command::Daemon { setup } => run_daemon(settings, setup).await,
    }
}

//! warden - quota enforcement and supervision for a metered proxy
//!
//! Thin CLI over `warden-core`: runs the daemon (admin API, enforcement loop,
//! supervised proxy), renders the proxy configuration, or runs a single
//! enforcement tick.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use warden_core::config::{Config, LogFormat};
use warden_core::enforcer::{QuotaEnforcer, spawn_enforcer};
use warden_core::logging::{LogConfig, init_logging};
use warden_core::persistence::{FileBlobStore, MemoryBlobStore, PersistenceGateway, load_accounts};
use warden_core::proxy_config::synthesize;
use warden_core::registry::RegistrySnapshot;
use warden_core::service::ControlPlane;
use warden_core::stats::CliStatsGateway;
use warden_core::supervisor::{CommandLauncher, ProcessSupervisor};
use warden_core::web::build_router;

/// warden - quota enforcement and supervision for a metered proxy
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "WARDEN_CONFIG", default_value = "warden.toml", global = true)]
    config: PathBuf,

    /// Log level or filter directive (overrides config; RUST_LOG wins)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon: admin API, enforcement loop and the proxy
    Serve {
        /// Keep accounts in memory only
        #[arg(long)]
        ephemeral: bool,

        /// Seconds to wait for the proxy to exit on shutdown
        #[arg(long, default_value = "10")]
        stop_grace_secs: u64,
    },

    /// Print the proxy configuration for the stored accounts
    RenderConfig {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one enforcement tick and print its report
    ///
    /// Never starts the proxy; a policy change is reported as
    /// `restart_required`. Refuses to run while a daemon answers on the
    /// admin port, since both would drain the same counters and write the
    /// same store.
    Tick {
        /// Skip the running-daemon check
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            let remediation = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<warden_core::Error>())
                .and_then(warden_core::Error::remediation);
            if let Some(remediation) = remediation {
                eprintln!("\n{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(Some(&cli.config))?;

    let mut log = LogConfig::from(&config.general);
    if let Some(level) = cli.log_level {
        log.level = level;
    }
    if let Some(format) = cli.log_format {
        log.format = format;
    }
    init_logging(&log).context("failed to initialize logging")?;

    match cli.command {
        Commands::Serve {
            ephemeral,
            stop_grace_secs,
        } => serve(&config, ephemeral, Duration::from_secs(stop_grace_secs)).await,
        Commands::RenderConfig { output } => render_config(&config, output.as_deref()).await,
        Commands::Tick { force } => tick(&config, force).await,
    }
}

fn open_store(config: &Config, ephemeral: bool) -> Arc<dyn PersistenceGateway> {
    if ephemeral {
        Arc::new(MemoryBlobStore::new())
    } else {
        Arc::new(FileBlobStore::new(&config.storage.dir))
    }
}

async fn bootstrap(config: &Config, ephemeral: bool) -> Result<Arc<ControlPlane>> {
    let store = open_store(config, ephemeral);
    let supervisor = ProcessSupervisor::new(
        Arc::new(CommandLauncher::from_settings(&config.proxy)),
        config.proxy.clone(),
    );
    let plane = ControlPlane::bootstrap(supervisor, store, &config.storage.key, config.proxy.port)
        .await
        .map_err(warden_core::Error::from)
        .context("failed to load accounts")?;
    Ok(Arc::new(plane))
}

fn stats_gateway(config: &Config) -> Arc<CliStatsGateway> {
    Arc::new(
        CliStatsGateway::new(config.stats_binary(), config.stats_server())
            .with_timeout(config.stats.query_timeout()),
    )
}

async fn serve(config: &Config, ephemeral: bool, grace: Duration) -> Result<()> {
    let plane = bootstrap(config, ephemeral).await?;
    info!(
        accounts = plane.registry().len().await,
        ephemeral,
        "Accounts loaded"
    );

    plane
        .restart_proxy()
        .await
        .map_err(warden_core::Error::from)
        .context("initial proxy start failed")?;

    let enforcer = spawn_enforcer(
        QuotaEnforcer::new(Arc::clone(&plane), stats_gateway(config)),
        config.enforcer.interval(),
    );

    let listener = tokio::net::TcpListener::bind((config.admin.listen.as_str(), config.admin.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind admin API on {}:{}",
                config.admin.listen, config.admin.port
            )
        })?;
    info!(listen = %config.admin.listen, port = config.admin.port, "Admin API listening");

    let served = axum::serve(listener, build_router(Arc::clone(&plane)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin API server error");

    enforcer.signal_shutdown();
    enforcer.join().await;
    plane.shutdown(grace).await;
    info!("Shutdown complete");
    served
}

async fn render_config(config: &Config, output: Option<&Path>) -> Result<()> {
    let store = open_store(config, false);
    let accounts = load_accounts(store.as_ref(), &config.storage.key)
        .await
        .map_err(warden_core::Error::from)
        .context("failed to load accounts")?;
    let document = synthesize(&RegistrySnapshot::new(accounts), config.proxy.port, &config.proxy);
    let json = serde_json::to_string_pretty(&document)?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Proxy config written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn tick(config: &Config, force: bool) -> Result<()> {
    if !force {
        ensure_daemon_not_running(config).await?;
    }
    let plane = bootstrap(config, false).await?;
    let report = QuotaEnforcer::new(plane, stats_gateway(config))
        .without_restart()
        .run_tick()
        .await;
    if report.restart_required {
        warn!(
            "Accounts were deactivated; restart the proxy to apply (POST /restart on the daemon)"
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn ensure_daemon_not_running(config: &Config) -> Result<()> {
    let host = match config.admin.listen.as_str() {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    };
    let attempt = tokio::time::timeout(
        Duration::from_millis(500),
        tokio::net::TcpStream::connect((host, config.admin.port)),
    )
    .await;
    if matches!(attempt, Ok(Ok(_))) {
        anyhow::bail!(
            "a daemon is listening on {host}:{}; stop it or pass --force",
            config.admin.port
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

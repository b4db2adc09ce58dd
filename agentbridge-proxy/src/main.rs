//! AgentBridge: exposes agents on a pub/sub bus as MCP tools and resources,
//! A2A agents and REST endpoints.
//!
//! Runs standalone over in-memory backends, with the admin server carrying
//! probes, metrics, the control API and the REST front end.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use agentbridge_core::config::{
    BridgeDefaults, Config, ConfigError, find_config_file, load_and_validate,
};
use agentbridge_core::lifecycle::{Condition, DrainOutcome, LifecycleManager};
use agentbridge_core::metrics::BridgeMetrics;
use agentbridge_proxy::admin::{AdminServer, AdminState};
use agentbridge_proxy::standalone::StandaloneBridge;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    /// If not specified, searches: AGENTBRIDGE_CONFIG env, /etc/agentbridge/config.yaml, ./config.yaml
    #[arg(long, env = "AGENTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Admin bind address (overrides admin.bind)
    #[arg(short, long)]
    bind: Option<String>,

    /// Admin port (overrides admin.port)
    #[arg(short, long, env = "AGENTBRIDGE_ADMIN_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard must live for the whole process so buffered logs are flushed.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(msg) = BridgeDefaults::from_env().validate() {
        error!(reason = %msg, "Invalid configuration defaults, refusing to start");
        std::process::exit(1);
    }

    let lifecycle = Arc::new(LifecycleManager::new());

    let mut config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(bind) = cli.bind {
        config.admin.bind = bind;
    }
    if let Some(port) = cli.port {
        config.admin.port = port;
    }
    lifecycle.satisfy(Condition::ConfigLoaded);

    let mut prom_registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(BridgeMetrics::new(&mut prom_registry));

    let bridge = StandaloneBridge::start(&config, Some(metrics)).await?;

    {
        let lifecycle = lifecycle.clone();
        let coordinator = bridge.coordinator.clone();
        tokio::spawn(async move {
            coordinator.wait_until_loaded().await;
            lifecycle.satisfy(Condition::RegistrationsLoaded);
        });
    }

    let shutdown = lifecycle.shutdown_token();
    setup_signal_handlers(lifecycle.clone());

    let admin = AdminServer::new(
        &config.admin,
        AdminState {
            lifecycle: lifecycle.clone(),
            prom_registry: Arc::new(prom_registry),
            coordinator: bridge.coordinator.clone(),
            rest: bridge.server.clone(),
        },
    );
    let admin_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin.run(shutdown.clone()).await {
                error!(error = %e, "Admin server failed");
                shutdown.cancel();
            }
        })
    };

    shutdown.cancelled().await;
    lifecycle.begin_shutdown();

    // Stop accepting, drain calls in progress, then tear down.
    let drain_timeout = config.admin.shutdown_timeout();
    info!(
        in_flight = lifecycle.in_flight_calls(),
        drain_timeout_ms = drain_timeout.as_millis() as u64,
        "Draining calls in flight"
    );
    let drained = lifecycle.drain_calls(drain_timeout).await;

    bridge.shutdown().await;
    if let Err(e) = admin_task.await {
        warn!(error = %e, "Admin server task ended abnormally");
    }
    lifecycle.mark_stopped();

    match drained {
        DrainOutcome::Drained => {
            info!("All calls drained, shut down cleanly");
            Ok(())
        }
        DrainOutcome::Abandoned { in_flight } => {
            Err(format!("shut down with {in_flight} calls still in flight").into())
        }
    }
}

/// An explicit `--config` must exist; without one, a missing file means
/// built-in defaults.
fn load_configuration(cli: &Cli) -> Result<Config, ConfigError> {
    match find_config_file(cli.config.as_deref()) {
        Ok(path) => {
            let config = load_and_validate(&path)?;
            info!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        Err(ConfigError::ConfigFileNotFound { searched }) if cli.config.is_none() => {
            info!(searched = ?searched, "No configuration file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e),
    }
}

/// SIGINT and SIGTERM begin graceful shutdown.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    lifecycle.begin_shutdown();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = lifecycle;
}

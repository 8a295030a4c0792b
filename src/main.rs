//! gslb-watch: dashboard client for a GSLB-fronted traffic API.
//!
//! ```text
//! gslb-watch --config gslb-watch.toml run
//! gslb-watch --base-url http://10.0.0.5:8080 fetch /api/accidents/stats --profile polling
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use gslb_watch::client::{endpoint, ApiRequest, ReqwestTransport, Transport};
use gslb_watch::config::{Config, ConfigOverrides, LogFormat};
use gslb_watch::dashboard::Dashboard;
use gslb_watch::resilience::{
    HealthState, HttpProbe, LogIndicator, Probe, RequestExecutor, RetryConfig, TimeoutExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gslb-watch", version, about = "Resilient GSLB dashboard client")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override `api.base_url`
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Override `logging.level` (RUST_LOG still wins)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every configured feed and monitor cluster health (default)
    Run,
    /// Probe the liveness endpoint once
    Probe,
    /// Fetch one path through the retrying executor and print the body
    Fetch {
        path: String,

        #[arg(long, value_enum, default_value_t = Profile::Initial)]
        profile: Profile,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Initial,
    Polling,
}

impl From<Profile> for RetryConfig {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Initial => Self::initial_load(),
            Profile::Polling => Self::polling(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        base_url: cli.base_url.clone(),
        log_level: cli.log_level.clone(),
        log_format: cli.log_format,
    };
    let config = Config::load_with_overrides(cli.config.as_deref(), &overrides)
        .context("failed to load configuration")?;

    gslb_watch::logging::init(&config.logging).context("failed to initialize logging")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config).await,
        Command::Probe => probe(&config).await,
        Command::Fetch { path, profile } => fetch(&config, &path, profile.into()).await,
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = ReqwestTransport::new(&config.http_client_config())
        .context("failed to build HTTP client")?;
    Ok(Arc::new(transport))
}

async fn run(config: &Config) -> anyhow::Result<()> {
    info!(base_url = %config.api.base_url, "gslb-watch starting");

    let dashboard = Dashboard::new(config, transport(config)?, Arc::new(LogIndicator))?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    dashboard.run(cancel).await;

    for snapshot in dashboard.snapshots().await {
        info!(
            feed = %snapshot.name,
            last_update = ?snapshot.last_update,
            consecutive_errors = snapshot.consecutive_errors,
            "Final feed state"
        );
    }
    Ok(())
}

async fn probe(config: &Config) -> anyhow::Result<()> {
    let probe = HttpProbe::new(transport(config)?, &config.base_url()?)?;
    let timeout = config.monitor_config().probe_timeout;

    match probe
        .check()
        .with_timeout_duration(timeout)
        .await
        .and_then(|checked| checked)
    {
        Ok(()) => {
            println!("healthy: {}", probe.url());
            Ok(())
        }
        Err(e) => {
            error!("Probe failed: {}", e);
            bail!("unhealthy: {} ({e})", probe.url())
        }
    }
}

async fn fetch(config: &Config, path: &str, retry: RetryConfig) -> anyhow::Result<()> {
    let url = endpoint(&config.base_url()?, path)?;
    let state = Arc::new(HealthState::new(config.monitor.failure_threshold)?);
    let executor = RequestExecutor::new(transport(config)?, state.clone());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        interrupt.cancel();
    });

    let response = executor
        .execute(&ApiRequest::get(url), &retry, &cancel)
        .await
        .with_context(|| format!("GET {path} failed"))?;

    if state.is_transitioning() {
        info!("Cluster transition was requested while fetching");
    }
    println!("{}", response.text());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
}

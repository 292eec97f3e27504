//! a3s-relay - Telegram relay for remote agent sessions

use a3s_relay::config::{load_config, RelayConfig};
use a3s_relay::{
    Bot, ChatTransport, HttpSessionService, PollerConfig, SessionTreeGateway, TelegramClient,
    UpdatePoller,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "a3s-relay")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Telegram relay for remote agent sessions")]
struct Cli {
    /// Configuration file path (.hcl or .json)
    #[arg(short, long, env = "A3S_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start relaying
    Run,

    /// Check connectivity to the agent service and the Bot API
    Check,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("a3s_relay={}", log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match cli.command {
        Commands::Config { default } => {
            let config = if default {
                RelayConfig::default()
            } else {
                load_config(cli.config.as_ref())?.0
            };
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Commands::Check => {
            let (config, _) = load_config(cli.config.as_ref())?;
            run_check(&config).await
        }
        Commands::Run => {
            let (config, config_path) = load_config(cli.config.as_ref())?;
            if let Some(path) = &config_path {
                tracing::debug!("Config loaded from {}", path.display());
            }
            run_relay(config).await
        }
    }
}

fn build_service(config: &RelayConfig) -> Result<Arc<HttpSessionService>> {
    let service = HttpSessionService::new(
        &config.remote.base_url,
        Duration::from_secs(config.remote.request_timeout_secs),
    )
    .context("Failed to create agent service client")?;
    Ok(Arc::new(service))
}

fn build_transport(config: &RelayConfig) -> Result<Arc<TelegramClient>> {
    let token = config.bot_token().context("Failed to resolve bot token")?;
    Ok(Arc::new(TelegramClient::new(token, config.request_margin())))
}

async fn run_check(config: &RelayConfig) -> Result<()> {
    config.validate()?;
    let service = build_service(config)?;
    let gateway = SessionTreeGateway::new(
        service,
        config.agent.working_directory.clone(),
        config.remote.web_url(),
    );

    match gateway.probe().await {
        Ok(probe) => println!(
            "✅ Agent service {} (version {}, {} config keys)",
            config.remote.base_url,
            probe.health.version,
            probe.config.as_object().map_or(0, |o| o.len())
        ),
        Err(e) => println!("❌ Agent service {}: {}", config.remote.base_url, e),
    }

    let transport = build_transport(config)?;
    match transport.get_me().await {
        Ok(me) => println!(
            "✅ Telegram bot @{} ({})",
            me.username.as_deref().unwrap_or(&me.first_name),
            me.id
        ),
        Err(e) => println!("❌ Telegram: {}", e),
    }
    Ok(())
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    config.validate()?;
    if config.telegram.allowed_users.is_empty() {
        tracing::warn!("No allowed users configured; anyone can use this bot");
    }

    let service = build_service(&config)?;
    let transport = build_transport(&config)?;

    let bot = Bot::new(config.clone(), service, transport.clone());
    match bot.gateway().probe().await {
        Ok(probe) => tracing::info!(
            url = %config.remote.base_url,
            version = %probe.health.version,
            "Agent service reachable"
        ),
        Err(e) => tracing::warn!(url = %config.remote.base_url, "Agent service check failed: {}", e),
    }

    tracing::info!(
        agent = %config.agent.default_agent,
        directory = %config.agent.working_directory,
        "Starting a3s-relay"
    );

    let registry = bot.registry().clone();
    let max_age = config.idle_timeout();
    let sweep_interval = config.sweep_interval();
    let sweeper = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + sweep_interval, sweep_interval);
        loop {
            ticker.tick().await;
            registry.sweep_idle(max_age);
        }
    });

    let poller = Arc::new(UpdatePoller::new(
        transport,
        Arc::new(bot.clone()),
        PollerConfig {
            wait: config.poll_timeout(),
            backoff: config.retry_backoff(),
            grace: config.shutdown_grace(),
        },
    ));
    let mut handle = poller.spawn();

    tokio::select! {
        result = &mut handle => {
            sweeper.abort();
            result.context("Update poller crashed")?;
            return Ok(());
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
    }

    poller.stop().await;
    sweeper.abort();
    if !bot.wait_idle(config.shutdown_grace()).await {
        tracing::warn!(
            in_flight = bot.registry().in_flight_count(),
            "Invocations still running at shutdown"
        );
    }
    tracing::info!("a3s-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

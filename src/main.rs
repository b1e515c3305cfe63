//! Fleet CLI
//!
//! Runs the scanner (session pool and rate-gated map calls), the reverse
//! tunnel broker its proxies come from, or a tunnel agent.

mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_agent::{Agent, AgentConfig};
use fleet_dispatch::{
    preload_sessions, CallOrchestrator, ResourceProvisioner, ScannerServer, SessionPool,
    StaticUpstreamFactory,
};
use fleet_proto::Proxy;
use fleet_store::{InMemoryInventory, InMemoryObjectStore, Inventory};
use fleet_tunnel::TunnelBroker;
use settings::{Settings, SettingsArgs};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fleet - scanner sessions over tunnelled proxies
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(about = "Fleet - scanner sessions over tunnelled proxies")]
#[command(version = env!("FLEET_VERSION"))]
#[command(long_version = concat!(
    env!("FLEET_VERSION"),
    "\ncommit: ",
    env!("FLEET_COMMIT"),
    "\nbuilt: ",
    env!("FLEET_BUILT_AT")
))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel broker and the scanner in one process sharing the inventory
    #[command(long_about = r#"
Run the tunnel broker and the scanner in one process. Agents that connect
to the broker become proxies the scanner can hand to new sessions.

EXAMPLES:
  fleet serve --accounts-file accounts.json --secret hunter2

  fleet serve --config fleet.json --mock-payload map.json

ENVIRONMENT VARIABLES:
  FLEET_CONFIG           JSON settings file
  FLEET_ACCOUNTS_FILE    Accounts to import at startup
  FLEET_SECRET           Secret required by GET /status
  FLEET_SCANNER_ADDR     Scanner HTTP address
  FLEET_AGENT_ADDR       Broker address agents connect to
  FLEET_FORWARD_ADDR     Broker forwarding address
    "#)]
    Serve,

    /// Run the tunnel broker only
    Broker,

    /// Run the scanner only
    Scanner {
        /// Idle proxy records to seed, since no broker registers any here
        #[arg(long, env = "FLEET_STATIC_PROXIES", default_value = "0")]
        static_proxies: u64,
    },

    /// Connect to a broker and perform the requests it forwards
    Agent {
        /// Broker agent endpoint
        #[arg(
            long,
            env = "FLEET_BROKER_URL",
            default_value = "ws://127.0.0.1:8081/websocket"
        )]
        broker: String,

        /// Parallel connections, each registered as its own proxy
        #[arg(long, env = "FLEET_AGENT_CONNECTIONS", default_value = "1")]
        connections: usize,

        /// Maximum consecutive reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging; `RUST_LOG` overrides the level picked by `--verbose`
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// In-memory inventory, seeded from the accounts file if one is configured
async fn build_inventory(settings: &Settings) -> Result<Arc<InMemoryInventory>> {
    let inventory = Arc::new(InMemoryInventory::new());

    if let Some(path) = &settings.accounts_file {
        let count = inventory
            .import_accounts(path)
            .await
            .with_context(|| format!("Failed to import accounts from {}", path.display()))?;
        info!("Imported {} accounts from {}", count, path.display());
    } else {
        warn!("No accounts file configured, the scanner will answer busy");
    }

    Ok(inventory)
}

/// Periodically drop dead proxies and report unusable accounts
fn spawn_sweeper(inventory: Arc<dyn Inventory>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match inventory.sweep().await {
                Ok(report) => info!(
                    removed_proxies = report.removed_proxies,
                    banned_accounts = report.banned_accounts,
                    flagged_accounts = report.flagged_accounts,
                    "Inventory sweep"
                ),
                Err(e) => warn!(error = %e, "Inventory sweep failed"),
            }
        }
    });
}

/// Wire the scanner over `inventory` and start preloading sessions
fn build_scanner(settings: &Settings, inventory: Arc<dyn Inventory>) -> Result<ScannerServer> {
    let factory = match &settings.mock_payload {
        Some(path) => {
            info!("Serving canned map payload from {}", path.display());
            StaticUpstreamFactory::from_file(path)
                .with_context(|| format!("Failed to load mock payload {}", path.display()))?
        }
        None => StaticUpstreamFactory::default(),
    };

    let provisioner = ResourceProvisioner::new(inventory, Arc::new(factory));
    let orchestrator = Arc::new(CallOrchestrator::new(
        settings.dispatch_config(),
        SessionPool::new(Vec::new()),
        provisioner,
        Arc::new(InMemoryObjectStore::new()),
    ));

    let count = settings.initial_sessions;
    if count > 0 {
        let preloading = orchestrator.clone();
        tokio::spawn(async move {
            let ready = preload_sessions(&preloading, count).await;
            info!("Preloaded {}/{} sessions", ready, count);
        });
    }

    Ok(ScannerServer::new(settings.scanner_config(), orchestrator))
}

async fn run_until_ctrl_c<F>(name: &str, server: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = server => {
            if let Err(ref e) = result {
                error!("{} stopped: {:#}", name, e);
            }
            result
        }
    }
}

async fn run_serve(settings: Settings) -> Result<()> {
    let inventory = build_inventory(&settings).await?;
    spawn_sweeper(inventory.clone(), settings.sweep_interval);

    let broker = TunnelBroker::new(settings.broker_config(), inventory.clone())
        .await
        .context("Failed to start tunnel broker")?;
    let scanner = build_scanner(&settings, inventory)?;

    run_until_ctrl_c("Fleet", async move {
        tokio::try_join!(broker.start(), scanner.start())?;
        Ok(())
    })
    .await
}

async fn run_broker(settings: Settings) -> Result<()> {
    let inventory = Arc::new(InMemoryInventory::new());
    spawn_sweeper(inventory.clone(), settings.sweep_interval);

    let broker = TunnelBroker::new(settings.broker_config(), inventory)
        .await
        .context("Failed to start tunnel broker")?;

    run_until_ctrl_c("Broker", broker.start()).await
}

async fn run_scanner(settings: Settings, static_proxies: u64) -> Result<()> {
    let inventory = build_inventory(&settings).await?;
    for id in 1..=static_proxies {
        inventory
            .add_proxy(Proxy::new(id))
            .await
            .context("Failed to seed proxy records")?;
    }
    if static_proxies > 0 {
        info!("Seeded {} static proxies", static_proxies);
    }
    spawn_sweeper(inventory.clone(), settings.sweep_interval);

    let scanner = build_scanner(&settings, inventory)?;
    run_until_ctrl_c("Scanner", scanner.start()).await
}

async fn run_agents(config: AgentConfig, connections: usize) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    for n in 0..connections.max(1) {
        let agent = Agent::new(config.clone(), shutdown.clone())
            .context("Failed to create agent")?;
        tasks.spawn(async move {
            let result = agent.run().await;
            if let Err(ref e) = result {
                error!(connection = n, "Agent gave up: {}", e);
            }
            result
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
        _ = async { while tasks.join_next().await.is_some() {} } => {
            anyhow::bail!("All agent connections gave up");
        }
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn load_settings(args: &SettingsArgs) -> Result<Settings> {
    let settings = Settings::load(args)?;
    info!("Fleet {} ({}) starting...", env!("FLEET_VERSION"), env!("FLEET_COMMIT"));
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Agent {
            broker,
            connections,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            info!("Fleet agent {} starting...", env!("FLEET_VERSION"));
            info!("Broker: {}", broker);

            let config = AgentConfig {
                broker_url: broker,
                max_reconnect_attempts,
                initial_delay: Duration::from_secs(reconnect_delay),
                max_delay: Duration::from_secs(max_reconnect_delay),
            };
            run_agents(config, connections).await?;
        }
        Commands::Serve => run_serve(load_settings(&cli.settings)?).await?,
        Commands::Broker => run_broker(load_settings(&cli.settings)?).await?,
        Commands::Scanner { static_proxies } => {
            run_scanner(load_settings(&cli.settings)?, static_proxies).await?
        }
    }

    info!("Fleet stopped");
    Ok(())
}

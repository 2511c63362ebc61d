//! clusterbus - distributed resource-change event bus
//!
//! Runs one event bus per process against a shared store and serves
//! WebSocket subscribers.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clusterbus::gateway::{self, Authenticator, QueryUserAuthenticator, TokenAuthenticator};
use clusterbus::provider::memory::MemoryStore;
use clusterbus::provider::nats::{NatsConfig, NatsStore};
use clusterbus::provider::KvStore;
use clusterbus::{Backpressure, BusConfig, EventBus};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clusterbus")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Distributed resource-change event bus")]
struct Cli {
    /// Configuration file path (.json)
    #[arg(short, long, env = "CLUSTERBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "CLUSTERBUS_JSON_LOGS")]
    json_logs: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings applied on top of the configuration file
#[derive(Args, Debug, Default)]
struct ConfigOverrides {
    /// Key prefix watched and written by the bus
    #[arg(long, global = true, env = "CLUSTERBUS_PREFIX")]
    prefix: Option<String>,

    /// Lease TTL of published events, in seconds
    #[arg(long, global = true, env = "CLUSTERBUS_LEASE_TTL_SECS")]
    lease_ttl_secs: Option<u64>,

    /// Capacity of the watcher to dispatcher channel
    #[arg(long, global = true, env = "CLUSTERBUS_WATCH_BUFFER")]
    watch_buffer: Option<usize>,

    /// Behavior when the dispatcher falls behind the watcher
    #[arg(long, global = true, value_enum, env = "CLUSTERBUS_BACKPRESSURE")]
    backpressure: Option<BackpressureArg>,

    /// Upper bound on concurrent connection writes
    #[arg(long, global = true, env = "CLUSTERBUS_MAX_INFLIGHT_WRITES")]
    max_inflight_writes: Option<usize>,

    /// Per-connection outbound queue length
    #[arg(long, global = true, env = "CLUSTERBUS_OUTBOUND_BUFFER")]
    outbound_buffer: Option<usize>,

    /// Deregister a connection on its first failed write
    #[arg(long, global = true, env = "CLUSTERBUS_EVICT_ON_WRITE_FAILURE")]
    evict_on_write_failure: Option<bool>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut BusConfig) {
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(secs) = self.lease_ttl_secs {
            config.lease_ttl_secs = secs;
        }
        if let Some(buffer) = self.watch_buffer {
            config.watch_buffer = buffer;
        }
        if let Some(mode) = self.backpressure {
            config.backpressure = mode.into();
        }
        if let Some(limit) = self.max_inflight_writes {
            config.max_inflight_writes = limit;
        }
        if let Some(buffer) = self.outbound_buffer {
            config.outbound_buffer = buffer;
        }
        if let Some(evict) = self.evict_on_write_failure {
            config.evict_on_write_failure = evict;
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackpressureArg {
    Block,
    DropNewest,
}

impl From<BackpressureArg> for Backpressure {
    fn from(arg: BackpressureArg) -> Self {
        match arg {
            BackpressureArg::Block => Backpressure::Block,
            BackpressureArg::DropNewest => Backpressure::DropNewest,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the event bus and its WebSocket gateway
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8686", env = "CLUSTERBUS_LISTEN")]
        listen: SocketAddr,

        /// Store backend shared by all processes
        #[arg(long, value_enum, default_value_t = StoreKind::Memory, env = "CLUSTERBUS_STORE")]
        store: StoreKind,

        /// NATS server URL (with --store nats)
        #[arg(long, env = "CLUSTERBUS_NATS_URL")]
        nats_url: Option<String>,

        /// NATS key-value bucket (with --store nats)
        #[arg(long, env = "CLUSTERBUS_NATS_BUCKET")]
        nats_bucket: Option<String>,

        /// Accept `Authorization: Bearer` tokens, as TOKEN=USER_ID (repeatable).
        /// Without any, the `user_id` query parameter is trusted.
        #[arg(long = "token", value_name = "TOKEN=USER_ID")]
        tokens: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StoreKind {
    Memory,
    Nats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve {
            listen,
            store,
            nats_url,
            nats_bucket,
            tokens,
        } => {
            let store = connect_store(store, nats_url, nats_bucket, &config).await?;
            let auth = build_authenticator(&tokens)?;
            serve(config, store, auth, listen).await?;
        }
        Commands::Config => {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize configuration")?;
            println!("{}", json);
        }
    }

    Ok(())
}

/// File (or defaults), then flag / env overrides, then validation
fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = match &cli.config {
        Some(path) => BusConfig::from_file(path)?,
        None => BusConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("clusterbus={}", log_level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn connect_store(
    kind: StoreKind,
    nats_url: Option<String>,
    nats_bucket: Option<String>,
    config: &BusConfig,
) -> Result<Arc<dyn KvStore>> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::default())),
        StoreKind::Nats => {
            let mut nats = NatsConfig {
                max_age_secs: config.lease_ttl_secs,
                ..Default::default()
            };
            if let Some(url) = nats_url {
                nats.url = url;
            }
            if let Some(bucket) = nats_bucket {
                nats.bucket = bucket;
            }
            let url = nats.url.clone();
            let store = NatsStore::connect(nats)
                .await
                .with_context(|| format!("Failed to connect to NATS at {}", url))?;
            Ok(Arc::new(store))
        }
    }
}

fn build_authenticator(tokens: &[String]) -> Result<Arc<dyn Authenticator>> {
    if tokens.is_empty() {
        return Ok(Arc::new(QueryUserAuthenticator));
    }

    let mut auth = TokenAuthenticator::new();
    for entry in tokens {
        let (token, user_id) = entry
            .split_once('=')
            .filter(|(token, user)| !token.is_empty() && !user.is_empty())
            .with_context(|| format!("Invalid --token '{}', expected TOKEN=USER_ID", entry))?;
        auth = auth.with_token(token, user_id);
    }
    Ok(Arc::new(auth))
}

async fn serve(
    config: BusConfig,
    store: Arc<dyn KvStore>,
    auth: Arc<dyn Authenticator>,
    listen: SocketAddr,
) -> Result<()> {
    let bus = EventBus::start(store, config)
        .await
        .context("Failed to start event bus")?;
    let app = gateway::router(bus.gateway(auth));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    tracing::info!(addr = %listen, store = bus.store_name(), "Gateway listening");

    let shutdown = bus.cancel_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("Gateway server failed")?;

    bus.shutdown().await.context("Event bus stopped with an error")?;
    Ok(())
}

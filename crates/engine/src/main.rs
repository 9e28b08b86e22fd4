// marginalia-sync: headless sync node. Mirrors one annotation layer from
// PostgreSQL into a local store and logs what happens until Ctrl-C.
// `marginalia-sync relay` runs the channel relay that nodes in different
// processes share.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use marginalia_common::model::User;
use marginalia_engine::config::EngineConfig;
use marginalia_engine::lifecycle::{Lifecycle, LifecycleEvent};
use marginalia_engine::presence::PresenceEvent;
use marginalia_engine::selection::Selection;
use marginalia_engine::store::Store;
use marginalia_engine::sync::postgres::PgBackingStore;
use marginalia_engine::sync::relay::{self, RelayState};
use marginalia_engine::sync::{LocalHub, PeerIdentity, RealtimeChannel, SyncEngine, SyncEvent, WsChannel};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "marginalia-sync",
    about = "Headless annotation sync node",
    long_about = "Headless annotation sync node.\n\n\
        Nodes in different processes share a channel through a relay: start one \
        with `marginalia-sync relay` and point every node at it with --relay-url. \
        Without a relay the channel is in-process and the node only syncs through \
        the database change feed."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Config file (default: $MARGINALIA_CONFIG or ~/.marginalia/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// PostgreSQL URL (overrides config and $MARGINALIA_DATABASE_URL).
    #[arg(long)]
    database_url: Option<String>,
    /// Realtime channel name (overrides config).
    #[arg(long)]
    channel: Option<String>,
    /// Channel relay base URL, e.g. ws://127.0.0.1:7700 (overrides config and
    /// $MARGINALIA_RELAY_URL).
    #[arg(long)]
    relay_url: Option<String>,
    /// User id to act as; an anonymous guest when omitted.
    #[arg(long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the channel relay that sync nodes connect to with --relay-url.
    Relay {
        /// Listen address (default: relay.listen from config).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let path = cli.config.clone().or_else(|| std::env::var_os("MARGINALIA_CONFIG").map(PathBuf::from));
    let mut config = match path {
        Some(path) => EngineConfig::load_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::load(),
    };

    if let Ok(url) = std::env::var("MARGINALIA_DATABASE_URL") {
        config.database.url = Some(url);
    }
    if let Some(url) = &cli.database_url {
        config.database.url = Some(url.clone());
    }
    if let Some(channel) = &cli.channel {
        config.channel = channel.clone();
    }
    if let Ok(url) = std::env::var("MARGINALIA_RELAY_URL") {
        config.relay.url = Some(url);
    }
    if let Some(url) = &cli.relay_url {
        config.relay.url = Some(url.clone());
    }
    Ok(config)
}

async fn run_relay(listen: Option<SocketAddr>, config: &EngineConfig) -> anyhow::Result<()> {
    let addr = match listen {
        Some(addr) => addr,
        None => config
            .relay
            .listen
            .parse()
            .with_context(|| format!("invalid relay listen address `{}`", config.relay.listen))?,
    };
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind relay on {addr}"))?;
    info!(%addr, "channel relay listening");

    tokio::select! {
        result = relay::serve(listener, RelayState::new()) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("relay shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    if let Some(Command::Relay { listen }) = cli.command {
        return run_relay(listen, &config).await;
    }

    let database_url = config
        .database
        .url
        .clone()
        .ok_or_else(|| anyhow!("no database url: pass --database-url or set MARGINALIA_DATABASE_URL"))?;

    info!(
        channel = %config.channel,
        database = %config.database.redacted_url().unwrap_or_default(),
        relay = %config.relay.url.as_deref().unwrap_or("none"),
        "starting sync node"
    );

    let backing = PgBackingStore::connect(&database_url, config.database.pool_config()).await?;
    backing.run_migrations().await?;

    let user = match cli.user {
        Some(id) => User::signed_in(id),
        None => User::anonymous_guest(),
    };
    let identity = PeerIdentity::new(user);

    match config.relay.url.as_deref() {
        Some(url) => {
            let channel = WsChannel::new(url, &config.channel);
            info!(relay = %channel.url(), "sharing the channel through the relay");
            run_node(&config, identity, backing, channel).await
        }
        None => {
            warn!("no relay configured: only engines in this process share the channel");
            run_node(&config, identity, backing, LocalHub::new(config.channel.clone()).channel()).await
        }
    }
}

async fn run_node<C: RealtimeChannel>(
    config: &EngineConfig,
    identity: PeerIdentity,
    backing: PgBackingStore,
    channel: C,
) -> anyhow::Result<()> {
    let store = Store::shared();
    let selection = Selection::new(Arc::clone(&store));
    let lifecycle = Lifecycle::new(Arc::clone(&store), Arc::clone(&selection));

    lifecycle.on(|event| match event {
        LifecycleEvent::Create(a) => info!(annotation = %a.id, "annotation created"),
        LifecycleEvent::Delete(a) => info!(annotation = %a.id, "annotation deleted"),
        LifecycleEvent::Update { annotation, .. } => info!(annotation = %annotation.id, "annotation updated"),
        LifecycleEvent::SelectionChanged(_) => {}
    });

    let engine = SyncEngine::new(
        identity,
        Arc::clone(&store),
        selection,
        lifecycle,
        Arc::new(backing),
        Arc::new(channel),
        config.sync_options(),
    );

    engine.events().subscribe(|event| match event {
        SyncEvent::InitialLoad(annotations) => info!(count = annotations.len(), "layer loaded"),
        SyncEvent::InitialLoadError(err) => error!(error = %err, "layer could not be loaded"),
        SyncEvent::SaveError(err) => error!(error = %err, "save failed"),
        SyncEvent::IntegrityError(err) => warn!(error = %err, "integrity error"),
    });
    engine.presence().subscribe(|event| {
        if let PresenceEvent::Presence(users) = event {
            info!(peers = users.len(), "presence changed");
        }
    });

    engine.connect().await.context("failed to connect sync engine")?;
    info!(annotations = store.len(), "sync node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

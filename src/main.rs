use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyshare_custody::{
    api::{self, AppState},
    config::Config,
    engine::TranscriptEngine,
    health::{HealthMonitor, NodeHealthRegistry},
    identity::StaticTokenVerifier,
    model::KeyShareNodeMeta,
    node::{
        server::{self, NodeState},
        HttpNodeRpc, NodeRpc,
    },
    session::SessionStateMachine,
    shutdown_signal,
    store::{MemoryStore, Store},
    wallet::WalletService,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "custody")]
#[command(about = "Keyshare custody service and custodian node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the custody service
    Serve {
        /// Path to the TOML config file
        #[arg(short, long, env = "CUSTODY_CONFIG", default_value = "custody.toml")]
        config: PathBuf,
    },
    /// Run an in-memory custodian node
    Node {
        /// Address to listen on
        #[arg(short, long, env = "KS_NODE_BIND", default_value = "127.0.0.1:9001")]
        bind: SocketAddr,
    },
}

async fn serve(path: PathBuf) -> Result<()> {
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    let timeout = config.node_timeout();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(KeyShareNodeMeta {
        sss_threshold: config.custody.threshold,
    }));
    config.seed(store.as_ref()).await?;
    let rpc: Arc<dyn NodeRpc> = Arc::new(HttpNodeRpc::new(timeout)?);
    let cipher = config.cipher()?;

    HealthMonitor::new(store.clone(), rpc.clone(), timeout)
        .spawn(config.health_check_interval());

    let state = Arc::new(AppState {
        sessions: SessionStateMachine::new(
            store.clone(),
            Arc::new(TranscriptEngine::new()),
            cipher.clone(),
        ),
        wallets: WalletService::new(
            store.clone(),
            rpc,
            cipher,
            timeout,
            config.custody.auto_reshare,
        ),
        registry: NodeHealthRegistry::new(store),
        identity: Arc::new(StaticTokenVerifier::new(config.identities.clone())),
        admin_token: config.admin_token.clone(),
    });

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(
        addr = %listener.local_addr()?,
        nodes = config.nodes.len(),
        threshold = config.custody.threshold,
        "custody service listening"
    );
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Serve { config } => serve(config).await,
        Commands::Node { bind } => {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            server::serve(listener, NodeState::new()).await?;
            Ok(())
        }
    }
}

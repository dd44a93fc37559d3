use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatd::config::NodeConfig;
use chatd::network::ChatNetwork;
use chatd::server::Server;
use chatraft::Raft;
use sqlstore::SqlStore;

#[derive(Parser)]
#[command(name = "chatd", version, about = "A node of the raftchat replicated chat service.")]
struct Args {
    /// Location of the node configuration file.
    #[arg(long, value_name = "PATH", default_value = "Config.toml")]
    config: PathBuf,
    /// Tracing filter, e.g. "info" or "chatd=debug,chatraft=debug".
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(args).await {
        error!(error = %err, "node exited with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = NodeConfig::load(&args.config)?;
    let raft_config = Arc::new(config.raft_config()?);

    let store = Arc::new(SqlStore::open(&config.storage_path)?);
    let network = Arc::new(ChatNetwork::new(
        config.peer_addrs(),
        Duration::from_millis(raft_config.rpc_timeout),
    ));
    let raft = Raft::new(config.node_id, config.peer_ids(), raft_config, network, store.clone());

    let server = Server::new(config, raft.clone(), store);
    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }
    raft.shutdown().await?;
    Ok(())
}

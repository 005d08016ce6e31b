//! Tapedeck CLI

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tapedeck::config::{Config, Mode};
use tapedeck::logging;
use tapedeck::network::Server;
use tapedeck::proxy::HttpProxy;
use tapedeck::storage::RecordingStore;

#[derive(Debug, Parser)]
#[command(name = "tapedeck", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy server.
    Serve {
        /// Path to config TOML.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Operating mode: record, replay or record_once.
        #[arg(long)]
        mode: Option<Mode>,
        /// Address to listen on.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Upstream base URL.
        #[arg(long)]
        upstream: Option<String>,
        /// Root directory of the recording store.
        #[arg(long)]
        store_root: Option<PathBuf>,
        /// Log filter (trace, debug, info, warn, error, off, or directives).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// List recordings in a store.
    Inspect {
        /// Root directory of the recording store.
        store_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve {
            config,
            mode,
            listen,
            upstream,
            store_root,
            log_level,
        } => {
            let mut config = match (config, mode, store_root.clone()) {
                (Some(path), _, _) => Config::from_file(&path)
                    .with_context(|| format!("load config {}", path.display()))?,
                (None, Some(mode), Some(store_root)) => Config::new(mode, store_root),
                (None, _, _) => {
                    anyhow::bail!("either --config or both --mode and --store-root are required")
                }
            };
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(upstream) = upstream {
                config.upstream = Some(upstream);
            }
            if let Some(store_root) = store_root {
                config.store_root = store_root;
            }

            logging::init(&config.logging, log_level.as_deref())?;
            serve(&config).await
        }
        Command::Inspect { store_root } => inspect(&store_root).await,
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let proxy = Arc::new(HttpProxy::from_config(config)?);
    let server = Server::bind(config.listen, proxy, config.limits.max_connections)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    server.run().await?;
    Ok(())
}

async fn inspect(store_root: &Path) -> anyhow::Result<()> {
    if !store_root.is_dir() {
        anyhow::bail!("store root not found: {}", store_root.display());
    }

    let entries = RecordingStore::new(store_root).list().await?;
    println!("Store: {}", store_root.display());
    println!();
    for entry in &entries {
        let prefix = if entry.path_prefix.is_empty() {
            "/"
        } else {
            entry.path_prefix.as_str()
        };
        let state = if entry.complete {
            "complete"
        } else {
            "incomplete"
        };
        println!("{}  {:<10}  {}", entry.fingerprint, state, prefix);
    }

    let complete = entries.iter().filter(|e| e.complete).count();
    println!();
    println!(
        "{} recordings ({} complete, {} incomplete)",
        entries.len(),
        complete,
        entries.len() - complete
    );
    Ok(())
}

//! Reference daemon for the replicated document store.
//!
//! Starts one node: binds the listener, creates or reopens the data
//! directory, bootstraps a new cluster or joins an existing one, and serves
//! until interrupted.

use anyhow::Result;
use clap::Parser;
use raftdict::{Mux, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Replicated JSON document store node.
#[derive(Parser)]
#[command(name = "raftdictd", version, about, long_about = None)]
struct Args {
    /// Hostname to bind and advertise
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 4001)]
    port: u16,

    /// host:port of a cluster member to join
    #[arg(long, default_value = "")]
    join: String,

    /// Enable trace logging
    #[arg(long)]
    trace: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Node data directory
    path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.trace {
        "raftdict=trace"
    } else if args.debug {
        "raftdict=debug"
    } else {
        "raftdict=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let mux = Arc::new(Mux::new());
    let server = Server::new(&args.path, &args.host, args.port, mux.clone())?;

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    server.clone().install(&args.join).await?;
    tracing::info!(
        node = %server.name(),
        addr = %server.connection_string(),
        "node serving"
    );

    tokio::select! {
        result = mux.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            server.stop().await?;
        }
    }
    Ok(())
}

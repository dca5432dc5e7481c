//! Entry point for the syncd cloud synchronization storage engine.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use syncd::server::{ServerConfig, SyncServer};

/// Cloud synchronization storage engine.
///
/// Serves one shared mutable document to multiple devices with optimistic
/// concurrency, keeps a bounded history of syncs with 30-day snapshots, and
/// protects the admin credential with a tiered brute-force rate limiter.
#[derive(Parser, Debug)]
#[command(
    name = "syncd",
    version,
    author = "Shailesh <shailesh.pant@gmail.com>",
    about = "Cloud synchronization storage engine"
)]
struct Args {
    /// Path to the data directory where all persistent data is stored.
    #[arg(long, default_value = "syncd.data")]
    data_dir: String,

    /// Address to listen on for client traffic.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Admin credential clients present as a bearer token.
    #[arg(long, env = "SYNCD_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: String,

    /// Keep the main document in the size-limited blob store instead of the
    /// object store. Concurrent writers then race last-write-wins.
    #[arg(long, default_value_t = false)]
    blob_only: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level);

    let config = ServerConfig {
        data_dir: PathBuf::from(&args.data_dir),
        listen_addr: args.listen.clone(),
        admin_token: args.admin_token.clone(),
        use_object_store: !args.blob_only,
    };

    let server = SyncServer::new(config)?;

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    };

    info!("starting syncd...");
    match server.run(shutdown).await {
        Ok(()) => {
            info!("server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("server error: {:?}", e);
            Err(e)
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

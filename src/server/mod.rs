//! Server orchestration: opens the backends, wires the subsystems together,
//! and serves the HTTP surface until shutdown.
//!
//! Initialization order:
//! 1. Persistent store (one sled db, one tree per backend kind)
//! 2. Versioned record manager
//! 3. Backup & history manager (with its index cache)
//! 4. Auth rate limiter
//! 5. HTTP router

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::api::{router, AppState, SharedState};
use crate::auth::RateLimiter;
use crate::history::BackupManager;
use crate::record::RecordStore;
use crate::storage::{SledBlobStore, SledObjectStore, StorageBackend};

/// Configuration for the sync server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Path to the data directory where sled stores all persistent data.
    pub data_dir: PathBuf,

    /// Address to listen on for client traffic.
    pub listen_addr: String,

    /// The admin credential clients present as a bearer token.
    pub admin_token: String,

    /// When false, the main document is kept in the size-limited blob store
    /// instead of the object store, with the correspondingly weaker write
    /// guarantee.
    pub use_object_store: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("syncd.data"),
            listen_addr: "127.0.0.1:8080".to_string(),
            admin_token: String::new(),
            use_object_store: true,
        }
    }
}

/// The composed sync server.
pub struct SyncServer {
    config: ServerConfig,
    state: SharedState,
}

impl SyncServer {
    /// Creates a server instance, initializing every subsystem.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        if config.admin_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "an admin token is required; set --admin-token or SYNCD_ADMIN_TOKEN"
            ));
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let db = sled::open(&config.data_dir)?;

        let blob = SledBlobStore::new(db.open_tree("blob")?);
        let object: Option<Arc<dyn StorageBackend>> = if config.use_object_store {
            Some(SledObjectStore::new(db.open_tree("object")?))
        } else {
            None
        };

        let records = RecordStore::new(blob.clone(), object);
        let backups = BackupManager::new(blob.clone(), records.clone());
        let limiter = RateLimiter::new(blob);

        info!(
            data_dir = %config.data_dir.display(),
            object_store = config.use_object_store,
            "storage initialized"
        );

        let state = Arc::new(AppState {
            records,
            backups,
            limiter,
            admin_token: config.admin_token.clone(),
        });

        Ok(Self { config, state })
    }

    /// Shared handler state, exposed for in-process tests.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Runs the HTTP server until the shutdown future resolves.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "starting HTTP server");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("server stopped");
        Ok(())
    }
}

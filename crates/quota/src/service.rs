//! Main quota service implementation

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{
    allocator::QuotaAllocator, config::ServiceConfig, database::Database, directory::Directory,
    directory::StaticDirectory, handlers, orders::OrderManager,
};

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub allocator: Arc<QuotaAllocator>,
    pub orders: Arc<OrderManager>,
}

impl AppState {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<dyn Directory>,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            allocator: Arc::new(QuotaAllocator::new(db.clone(), directory.clone())),
            orders: Arc::new(OrderManager::new(db.clone(), directory, admission_timeout)),
            db,
        }
    }
}

/// Main quota service
pub struct QuotaServiceRunner {
    config: ServiceConfig,
    state: AppState,
}

impl QuotaServiceRunner {
    /// Connect to the ledger and load the directory
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database).await?);

        if config.create_schema {
            db.create_schema().await?;
        }

        let directory = StaticDirectory::from_json_file(&config.directory_file)?;

        let state = AppState::new(db, Arc::new(directory), config.admission_timeout());
        Ok(Self { config, state })
    }

    /// Run the HTTP server
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr;
        let app = handlers::router(self.state);
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("Starting quota service on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Get a handle to the database
    pub fn database(&self) -> &Arc<Database> {
        &self.state.db
    }
}

//! Standalone quota service binary

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use quota::database::mask_url;
use quota::{DatabaseConfig, QuotaServiceRunner, ServiceConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "quota-service")]
#[clap(about = "Daily territory quota ledger and order admission service")]
struct Args {
    /// Database connection URL (can also be set via QUOTA_DATABASE_URL env var)
    #[clap(long, env = "QUOTA_DATABASE_URL")]
    database_url: String,

    /// Listen address for the HTTP server
    #[clap(long, default_value = "0.0.0.0:8080", env = "QUOTA_LISTEN_ADDR")]
    listen_addr: SocketAddr,

    /// JSON file listing territories, dealers and products
    #[clap(long, env = "QUOTA_DIRECTORY_FILE")]
    directory_file: PathBuf,

    /// Maximum database connections in pool
    #[clap(long, default_value_t = 50, env = "QUOTA_MAX_CONNECTIONS")]
    max_connections: u32,

    /// Upper bound on a single order admission, in milliseconds
    #[clap(long, default_value_t = 5000, env = "QUOTA_ADMISSION_TIMEOUT_MS")]
    admission_timeout_ms: u64,

    /// Create missing tables on startup
    #[clap(long, env = "QUOTA_CREATE_SCHEMA")]
    create_schema: bool,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("quota={},tower_http=debug", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting quota service");
    tracing::info!("Database URL: {}", mask_url(&args.database_url));
    tracing::info!("Listen address: {}", args.listen_addr);
    tracing::info!("Admission timeout: {}ms", args.admission_timeout_ms);

    let mut database = DatabaseConfig::new(args.database_url);
    database.max_connections = args.max_connections;
    database.min_connections = database.min_connections.min(args.max_connections);

    let config = ServiceConfig {
        database,
        listen_addr: args.listen_addr,
        directory_file: args.directory_file,
        admission_timeout_ms: args.admission_timeout_ms,
        create_schema: args.create_schema,
    };

    let service = QuotaServiceRunner::new(config).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received shutdown signal");
    };

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                tracing::error!("Service error: {}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down gracefully");
        }
    }

    tracing::info!("Quota service stopped");
    Ok(())
}

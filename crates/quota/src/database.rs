//! Database connection and schema bootstrap for the quota ledger

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database as SeaOrmDatabase, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, PaginatorTrait, Schema, SqlErr,
    TransactionTrait,
};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::entity::{order_lines, orders, quotas};
use crate::error::{QuotaError, Result};

/// Attempts for read-only operations that hit a transient storage error
const MAX_READ_ATTEMPTS: u32 = 3;

/// Quota ledger database connection wrapper
#[derive(Clone)]
pub struct Database {
    connection: DatabaseConnection,
}

impl Database {
    /// Get a reference to the database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    pub fn backend(&self) -> DbBackend {
        self.connection.get_database_backend()
    }

    /// Wrap an existing connection
    pub fn from_connection(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    /// Create a new database connection with pool settings from config
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to quota database: {}", mask_url(&config.url));

        let mut attempts = 0;
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(2);

        // An in-memory SQLite database lives inside a single connection
        let (max_connections, min_connections) = if config.is_sqlite_memory() {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        loop {
            attempts += 1;

            let mut opt = ConnectOptions::new(config.url.clone());
            opt.max_connections(max_connections)
                .min_connections(min_connections)
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
                .idle_timeout(Duration::from_secs(300))
                .max_lifetime(Duration::from_secs(3600))
                .sqlx_logging(config.sqlx_logging)
                .sqlx_slow_statements_logging_settings(
                    tracing::log::LevelFilter::Warn,
                    Duration::from_millis(500),
                );

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    info!(
                        "Connected to quota database (max: {}, min: {})",
                        max_connections, min_connections
                    );
                    return Ok(Self { connection });
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    warn!(
                        "Failed to connect to quota database (attempt {}/{}): {}",
                        attempts, MAX_ATTEMPTS, e
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!("Failed to connect to quota database after {} attempts", MAX_ATTEMPTS);
                    return Err(QuotaError::Database(e));
                }
            }
        }
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let _ = quotas::Entity::find()
            .paginate(&self.connection, 1)
            .fetch_page(0)
            .await?;
        Ok(())
    }

    /// Create the ledger tables and their indexes when missing
    pub async fn create_schema(&self) -> Result<()> {
        let backend = self.backend();
        let schema = Schema::new(backend);

        let mut tables = vec![
            schema.create_table_from_entity(quotas::Entity),
            schema.create_table_from_entity(orders::Entity),
            schema.create_table_from_entity(order_lines::Entity),
        ];
        for table in tables.iter_mut() {
            table.if_not_exists();
            self.connection.execute(backend.build(&*table)).await?;
        }

        for mut index in schema.create_index_from_entity(orders::Entity) {
            index.if_not_exists();
            self.connection.execute(backend.build(&index)).await?;
        }

        info!("Quota ledger schema ready ({:?})", backend);
        Ok(())
    }

    /// Begin a database transaction
    pub async fn begin(&self) -> std::result::Result<DatabaseTransaction, DbErr> {
        self.connection.begin().await
    }
}

/// Commit on success, roll back on failure.
///
/// A failed commit leaves the outcome ambiguous (the server may have applied it
/// before the connection dropped), so it is reported as `UnknownOutcome`.
pub async fn finish<T>(txn: DatabaseTransaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            txn.commit()
                .await
                .map_err(|e| QuotaError::UnknownOutcome(format!("commit failed: {}", e)))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = txn.rollback().await {
                warn!("Rollback failed after {}: {}", e, rollback_err);
            }
            Err(e)
        }
    }
}

/// Run a read-only operation, retrying transient storage errors a bounded number of times
pub async fn with_read_retry<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, DbErr>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempts < MAX_READ_ATTEMPTS => {
                warn!(
                    "Transient error during {} (attempt {}/{}): {}",
                    operation, attempts, MAX_READ_ATTEMPTS, e
                );
                tokio::time::sleep(Duration::from_millis(100 * attempts as u64)).await;
            }
            Err(e) => return Err(QuotaError::Database(e)),
        }
    }
}

/// Map a storage error raised while mutating the ledger.
///
/// Transient failures become `UnknownOutcome`: the caller must check whether the
/// change landed before trying again.
pub fn mutation_error(err: DbErr) -> QuotaError {
    if is_transient(&err) {
        warn!("Transient error during ledger mutation: {}", err);
        QuotaError::UnknownOutcome(err.to_string())
    } else {
        QuotaError::Database(err)
    }
}

/// Connection loss, pool exhaustion, lock wait timeouts and deadlock victims
pub fn is_transient(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let msg = err.to_string();
            msg.contains("Lock wait timeout")
                || msg.contains("Deadlock found")
                || msg.contains("database is locked")
        }
        _ => false,
    }
}

pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Mask sensitive parts of database URL for logging
pub fn mask_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(password) = parsed.password() {
            return url.replacen(password, "****", 1);
        }
        return url.to_string();
    }
    // If parsing fails, mask the credentials between the scheme and '@'
    match (url.find("//"), url.find('@')) {
        (Some(slashes), Some(at)) if slashes < at => {
            format!("{}****{}", &url[..slashes + 2], &url[at..])
        }
        _ => url.to_string(),
    }
}

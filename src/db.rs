use crate::config::AppConfig;
use crate::errors::{is_transient_db_error, ServiceError};
use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, TransactionTrait};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Base delay between transaction attempts; doubled per retry
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `ServiceError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    gauge!("workshop.db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection establishment failed: {}", e);
        ServiceError::DatabaseError(e)
    })?;

    info!("Database connection pool established successfully");
    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Transactional access to the store.
///
/// Every workflow operation runs its reads and writes through
/// [`DatabaseAccess::transaction`], which commits on `Ok`, rolls back on `Err`,
/// aborts units of work that outlive the configured deadline and retries
/// storage-transient failures a bounded number of times.
#[derive(Debug, Clone)]
pub struct DatabaseAccess {
    pool: Arc<DbPool>,
    deadline: Duration,
    max_retries: u32,
}

impl DatabaseAccess {
    pub fn new(pool: Arc<DbPool>, deadline: Duration, max_retries: u32) -> Self {
        Self {
            pool,
            deadline,
            max_retries,
        }
    }

    pub fn from_app_config(pool: Arc<DbPool>, cfg: &AppConfig) -> Self {
        Self::new(pool, cfg.transaction_timeout(), cfg.transaction_max_retries)
    }

    /// Get a reference to the connection pool
    pub fn get_pool(&self) -> &DbPool {
        &self.pool
    }

    /// Runs `f` atomically.
    ///
    /// `f` may be invoked more than once when an attempt fails transiently, so
    /// it must build its future from owned clones of its inputs.
    pub async fn transaction<F, T>(&self, operation: &'static str, f: F) -> Result<T, ServiceError>
    where
        F: for<'c> Fn(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>>
            + Send
            + Sync,
        T: Send,
    {
        let transaction_id = Uuid::new_v4();
        let start = std::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            counter!("workshop.db.transaction.started", 1, "operation" => operation);

            match self.attempt(operation, transaction_id, &f).await {
                Ok(value) => {
                    counter!("workshop.db.transaction.committed", 1, "operation" => operation);
                    histogram!("workshop.db.transaction.duration", start.elapsed(), "operation" => operation);
                    debug!(
                        transaction_id = %transaction_id,
                        operation,
                        attempt,
                        "Transaction committed in {:?}",
                        start.elapsed()
                    );
                    return Ok(value);
                }
                Err(ServiceError::DatabaseError(err)) if is_transient_db_error(&err) => {
                    counter!("workshop.db.transaction.transient_failure", 1, "operation" => operation);
                    if attempt > self.max_retries {
                        error!(
                            transaction_id = %transaction_id,
                            operation,
                            attempt,
                            error = %err,
                            "Transaction failed transiently; retries exhausted"
                        );
                        return Err(ServiceError::TransientStorageFailure(format!(
                            "{} failed after {} attempts: {}",
                            operation, attempt, err
                        )));
                    }
                    warn!(
                        transaction_id = %transaction_id,
                        operation,
                        attempt,
                        error = %err,
                        "Transaction failed transiently; retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1)).await;
                }
                Err(err) => {
                    counter!("workshop.db.transaction.rolled_back", 1, "operation" => operation);
                    debug!(
                        transaction_id = %transaction_id,
                        operation,
                        error = %err,
                        "Transaction rolled back after {:?}",
                        start.elapsed()
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn attempt<F, T>(
        &self,
        operation: &'static str,
        transaction_id: Uuid,
        f: &F,
    ) -> Result<T, ServiceError>
    where
        F: for<'c> Fn(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>>
            + Send
            + Sync,
        T: Send,
    {
        let txn = self.pool.begin().await?;
        let outcome = tokio::time::timeout(self.deadline, f(&txn)).await;

        match outcome {
            Ok(Ok(value)) => {
                txn.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(
                        transaction_id = %transaction_id,
                        operation,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
            Err(_) => {
                counter!("workshop.db.transaction.deadline_exceeded", 1, "operation" => operation);
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(
                        transaction_id = %transaction_id,
                        operation,
                        error = %rollback_err,
                        "Rollback after deadline failed"
                    );
                }
                error!(
                    transaction_id = %transaction_id,
                    operation,
                    deadline = ?self.deadline,
                    "Transaction exceeded its deadline and was rolled back"
                );
                Err(ServiceError::TransientStorageFailure(format!(
                    "{} exceeded deadline of {:?}",
                    operation, self.deadline
                )))
            }
        }
    }
}

/// Runs database migrations
///
/// # Errors
/// Returns a `ServiceError` if migrations fail to execute
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Running database migrations");
    let start = std::time::Instant::now();

    let result = crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(ServiceError::DatabaseError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!("Database migrations completed successfully in {:?}", elapsed),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let start = std::time::Instant::now();
    let result = pool.ping().await.map_err(ServiceError::DatabaseError);

    match &result {
        Ok(_) => gauge!(
            "workshop.db.connection_latency",
            start.elapsed().as_millis() as f64
        ),
        Err(e) => {
            error!("Database connection check failed: {}", e);
            counter!("workshop.db.connection_failures", 1);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, DbErr, RuntimeErr, Statement};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn memory_access(deadline: Duration, retries: u32) -> DatabaseAccess {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let pool = establish_connection_with_config(&config).await.unwrap();
        pool.execute_unprepared("CREATE TABLE counters (id INTEGER PRIMARY KEY, value INTEGER NOT NULL)")
            .await
            .unwrap();
        pool.execute_unprepared("INSERT INTO counters (id, value) VALUES (1, 0)")
            .await
            .unwrap();
        DatabaseAccess::new(Arc::new(pool), deadline, retries)
    }

    async fn counter_value(access: &DatabaseAccess) -> i64 {
        let row = access
            .get_pool()
            .query_one(Statement::from_string(
                access.get_pool().get_database_backend(),
                "SELECT value FROM counters WHERE id = 1",
            ))
            .await
            .unwrap()
            .unwrap();
        row.try_get::<i64>("", "value").unwrap()
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let access = memory_access(Duration::from_secs(5), 0).await;
        access
            .transaction("bump", |txn| {
                Box::pin(async move {
                    txn.execute_unprepared("UPDATE counters SET value = value + 1 WHERE id = 1")
                        .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert_eq!(counter_value(&access).await, 1);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let access = memory_access(Duration::from_secs(5), 0).await;
        let result: Result<(), ServiceError> = access
            .transaction("bump_then_fail", |txn| {
                Box::pin(async move {
                    txn.execute_unprepared("UPDATE counters SET value = value + 1 WHERE id = 1")
                        .await?;
                    Err(ServiceError::BadRequest("abort".into()))
                })
            })
            .await;
        assert!(matches!(result, Err(ServiceError::BadRequest(_))));
        assert_eq!(counter_value(&access).await, 0);
    }

    #[tokio::test]
    async fn test_deadline_rolls_back_and_reports_transient() {
        let access = memory_access(Duration::from_millis(50), 3).await;
        let result: Result<(), ServiceError> = access
            .transaction("slow", |txn| {
                Box::pin(async move {
                    txn.execute_unprepared("UPDATE counters SET value = value + 1 WHERE id = 1")
                        .await?;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(ServiceError::TransientStorageFailure(_))));
        assert_eq!(counter_value(&access).await, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_surfaced() {
        let access = memory_access(Duration::from_secs(5), 2).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let result: Result<(), ServiceError> = access
            .transaction("locked", move |_txn| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::DatabaseError(DbErr::Exec(RuntimeErr::Internal(
                        "database is locked".into(),
                    ))))
                })
            })
            .await;
        assert!(matches!(result, Err(ServiceError::TransientStorageFailure(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let access = memory_access(Duration::from_secs(5), 2).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let value = access
            .transaction("flaky", move |txn| {
                let seen = seen.clone();
                Box::pin(async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(ServiceError::DatabaseError(DbErr::Exec(
                            RuntimeErr::Internal("deadlock detected".into()),
                        )));
                    }
                    txn.execute_unprepared("UPDATE counters SET value = value + 1 WHERE id = 1")
                        .await?;
                    Ok(42)
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(counter_value(&access).await, 1);
    }
}

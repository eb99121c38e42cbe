//! # Storage and Persistence
//!
//! SQLite connectivity, embedded migrations and the repositories backing the
//! secret core.

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use crate::config::DatabaseConfig;

pub use migrations::{
    get_migration_version, list_applied_migrations, run_migrations as run_db_migrations,
    validate_migrations, MigrationInfo,
};
pub use pool::{create_pool, get_pool_stats, DbPool, PoolStats};
pub use repositories::{
    EnvironmentData, EnvironmentRepository, FolderRepository, NewSecretRecord, ProjectData,
    ReferencingSecret, SecretChanges, SecretQuery, SecretReferenceRepository, SecretRepository,
    SecretVersionRepository, SecretVisibility, TagRepository,
};

use crate::errors::{KeyplaneError, Result};

/// Transaction handle used by repository `*_in_tx` methods
pub type DbTransaction<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

/// Run database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    migrations::run_migrations(pool).await
}

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| KeyplaneError::database(e, "Database connectivity check failed"))?;

    Ok(())
}

//! # Database Migration Management
//!
//! Schema evolution using SQL migrations embedded into the library at compile
//! time. Each migration runs in its own transaction and is recorded in the
//! `_keyplane_migrations` table together with a checksum of its SQL.

use crate::errors::{KeyplaneError, Result};
use crate::storage::DbPool;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{error, info, warn};

/// Embedded migrations as `(file stem, sql)` pairs, ordered by version
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "20250101000001_create_projects_and_environments",
        include_str!("../../migrations/20250101000001_create_projects_and_environments.sql"),
    ),
    (
        "20250101000002_create_secret_folders",
        include_str!("../../migrations/20250101000002_create_secret_folders.sql"),
    ),
    ("20250101000003_create_tags", include_str!("../../migrations/20250101000003_create_tags.sql")),
    (
        "20250101000004_create_secrets",
        include_str!("../../migrations/20250101000004_create_secrets.sql"),
    ),
    (
        "20250101000005_create_secret_versions",
        include_str!("../../migrations/20250101000005_create_secret_versions.sql"),
    ),
    (
        "20250101000006_create_secret_references",
        include_str!("../../migrations/20250101000006_create_secret_references.sql"),
    ),
];

/// Migration information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub installed_on: chrono::DateTime<chrono::Utc>,
    pub execution_time: i64,
    pub checksum: Vec<u8>,
}

/// Run all pending database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    info!("Starting database migration process");

    create_migration_table(pool).await?;
    let applied = get_applied_migration_versions(pool).await?;

    let mut migrations_run = 0;
    for (filename, sql) in MIGRATIONS {
        let version = extract_version_from_filename(filename)?;

        if applied.contains(&version) {
            info!(version = version, "Migration already applied: {}", filename);
            continue;
        }

        info!(version = version, "Running migration: {}", filename);
        let start_time = std::time::Instant::now();

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to start migration transaction"))?;

        sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(|e| {
            error!(error = %e, migration = filename, "Migration failed");
            KeyplaneError::database(e, format!("Migration failed: {}", filename))
        })?;

        let execution_time = start_time.elapsed().as_millis() as i64;
        let checksum = calculate_checksum(sql);

        sqlx::query(
            "INSERT INTO _keyplane_migrations (version, description, checksum, execution_time, installed_on) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(version)
        .bind(*filename)
        .bind(&checksum)
        .bind(execution_time)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, migration = filename, "Failed to record migration");
            KeyplaneError::database(e, format!("Failed to record migration: {}", filename))
        })?;

        tx.commit()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to commit migration transaction"))?;

        migrations_run += 1;
        info!(version = version, execution_time_ms = execution_time, "Migration completed: {}", filename);
    }

    if migrations_run > 0 {
        info!(count = migrations_run, "Database migrations completed");
    } else {
        info!("No pending migrations");
    }

    Ok(())
}

async fn create_migration_table(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _keyplane_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            checksum BLOB NOT NULL,
            execution_time BIGINT NOT NULL,
            installed_on DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
    "#,
    )
    .execute(pool)
    .await
    .map_err(|e| KeyplaneError::database(e, "Failed to create migration tracking table"))?;

    Ok(())
}

fn is_missing_table(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err)
        if db_err.message().contains("no such table: _keyplane_migrations"))
}

async fn get_applied_migrations(pool: &DbPool) -> Result<Vec<(i64, Vec<u8>)>> {
    let rows = sqlx::query("SELECT version, checksum FROM _keyplane_migrations ORDER BY version")
        .fetch_all(pool)
        .await;

    match rows {
        Ok(rows) => Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>("version"), row.get::<Vec<u8>, _>("checksum")))
            .collect()),
        // Table doesn't exist yet - expected before the first run
        Err(e) if is_missing_table(&e) => Ok(Vec::new()),
        Err(e) => Err(KeyplaneError::database(e, "Failed to get applied migrations")),
    }
}

async fn get_applied_migration_versions(pool: &DbPool) -> Result<Vec<i64>> {
    Ok(get_applied_migrations(pool).await?.into_iter().map(|(version, _)| version).collect())
}

/// Extract version number from migration filename
fn extract_version_from_filename(filename: &str) -> Result<i64> {
    let version_str = filename
        .split('_')
        .next()
        .ok_or_else(|| KeyplaneError::internal(format!("Invalid migration filename: {}", filename)))?;

    version_str
        .parse::<i64>()
        .map_err(|_| KeyplaneError::internal(format!("Invalid version in filename: {}", filename)))
}

/// Calculate checksum for migration content
fn calculate_checksum(content: &str) -> Vec<u8> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish().to_le_bytes().to_vec()
}

/// Validate that exactly the embedded migrations are applied, with matching checksums
pub async fn validate_migrations(pool: &DbPool) -> Result<bool> {
    info!("Validating migration integrity");

    let applied = get_applied_migrations(pool).await?;
    let mut expected = Vec::with_capacity(MIGRATIONS.len());
    for (filename, sql) in MIGRATIONS {
        expected.push((extract_version_from_filename(filename)?, calculate_checksum(sql)));
    }

    for (version, checksum) in &expected {
        match applied.iter().find(|(applied_version, _)| applied_version == version) {
            None => {
                warn!(version = version, "Missing migration");
                return Ok(false);
            }
            Some((_, applied_checksum)) if applied_checksum != checksum => {
                warn!(version = version, "Migration checksum mismatch");
                return Ok(false);
            }
            Some(_) => {}
        }
    }

    for (version, _) in &applied {
        if !expected.iter().any(|(expected_version, _)| expected_version == version) {
            warn!(version = version, "Unexpected migration found");
            return Ok(false);
        }
    }

    info!("Migration validation successful");
    Ok(true)
}

/// Get the current migration version (highest applied)
pub async fn get_migration_version(pool: &DbPool) -> Result<i64> {
    let applied = get_applied_migration_versions(pool).await?;
    Ok(applied.into_iter().max().unwrap_or(0))
}

/// List all applied migrations
pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<MigrationInfo>> {
    let rows = sqlx::query(
        "SELECT version, description, checksum, execution_time, installed_on FROM _keyplane_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await;

    match rows {
        Ok(rows) => Ok(rows
            .into_iter()
            .map(|row| MigrationInfo {
                version: row.get("version"),
                description: row.get("description"),
                installed_on: row.get("installed_on"),
                execution_time: row.get("execution_time"),
                checksum: row.get("checksum"),
            })
            .collect()),
        Err(e) if is_missing_table(&e) => Ok(Vec::new()),
        Err(e) => Err(KeyplaneError::database(e, "Failed to list applied migrations")),
    }
}

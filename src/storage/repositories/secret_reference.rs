//! Secret reference repository
//!
//! Edge set of the reference graph. A secret's outgoing edges are always
//! replaced as a whole; the inverse lookup answers "who points at this
//! address".

use crate::domain::{FolderId, ProjectId, SecretId, SecretReference};
use crate::errors::{KeyplaneError, Result};
use crate::storage::{DbPool, DbTransaction};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct SecretReferenceRow {
    pub secret_id: String,
    pub environment: String,
    pub secret_path: String,
    pub secret_key: String,
}

impl From<SecretReferenceRow> for SecretReference {
    fn from(row: SecretReferenceRow) -> Self {
        Self {
            secret_id: SecretId::from_string(row.secret_id),
            environment: row.environment,
            secret_path: row.secret_path,
            secret_key: row.secret_key,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct DependentRow {
    pub secret_id: String,
    pub secret_key: String,
    pub folder_id: String,
    pub environment: String,
}

/// A secret whose value references a given address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencingSecret {
    pub secret_id: SecretId,
    pub secret_key: String,
    pub folder_id: FolderId,
    /// Slug of the environment holding the referencing secret
    pub environment: String,
}

/// Repository for reference edges
#[derive(Debug, Clone)]
pub struct SecretReferenceRepository {
    pool: DbPool,
}

impl SecretReferenceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Delete every edge of `secret_id` and insert `references` in its place
    #[instrument(skip(self, tx, references), fields(secret_id = %secret_id, reference_count = references.len()), name = "db_replace_secret_references")]
    pub async fn replace_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        secret_id: &SecretId,
        references: &[SecretReference],
    ) -> Result<()> {
        sqlx::query("DELETE FROM secret_references WHERE secret_id = $1")
            .bind(secret_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to clear secret references");
                KeyplaneError::database(e, format!("Failed to clear references of '{}'", secret_id))
            })?;

        for reference in references {
            sqlx::query(
                "INSERT INTO secret_references (secret_id, environment, secret_path, secret_key) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(secret_id.as_str())
            .bind(&reference.environment)
            .bind(&reference.secret_path)
            .bind(&reference.secret_key)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to insert secret reference");
                KeyplaneError::database(e, format!("Failed to insert references of '{}'", secret_id))
            })?;
        }

        Ok(())
    }

    #[instrument(skip(self), fields(secret_id = %secret_id), name = "db_find_secret_references")]
    pub async fn find_by_secret_id(&self, secret_id: &SecretId) -> Result<Vec<SecretReference>> {
        let rows = sqlx::query_as::<_, SecretReferenceRow>(
            "SELECT secret_id, environment, secret_path, secret_key FROM secret_references \
             WHERE secret_id = $1 ORDER BY id",
        )
        .bind(secret_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %secret_id, "Failed to load secret references");
            KeyplaneError::database(e, format!("Failed to load references of '{}'", secret_id))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Secrets in `project_id` whose edges point at `(environment, secret_path, secret_key)`
    #[instrument(skip(self), fields(project_id = %project_id), name = "db_find_referencing_secrets")]
    pub async fn find_referencing(
        &self,
        project_id: &ProjectId,
        environment: &str,
        secret_path: &str,
        secret_key: &str,
    ) -> Result<Vec<ReferencingSecret>> {
        let rows = sqlx::query_as::<_, DependentRow>(
            "SELECT DISTINCT s.id AS secret_id, s.key AS secret_key, s.folder_id, e.slug AS environment \
             FROM secret_references r \
             JOIN secrets s ON s.id = r.secret_id \
             JOIN secret_folders f ON f.id = s.folder_id \
             JOIN environments e ON e.id = f.environment_id \
             WHERE e.project_id = $1 AND r.environment = $2 AND r.secret_path = $3 AND r.secret_key = $4 \
             ORDER BY e.slug, s.key",
        )
        .bind(project_id.as_str())
        .bind(environment)
        .bind(secret_path)
        .bind(secret_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_key = %secret_key, "Failed to find referencing secrets");
            KeyplaneError::database(e, format!("Failed to find secrets referencing '{}'", secret_key))
        })?;

        Ok(rows
            .into_iter()
            .map(|row| ReferencingSecret {
                secret_id: SecretId::from_string(row.secret_id),
                secret_key: row.secret_key,
                folder_id: FolderId::from_string(row.folder_id),
                environment: row.environment,
            })
            .collect())
    }
}

//! Folder repository
//!
//! CRUD over the `secret_folders` tree plus the path lookup that walks the
//! tree from an environment's root following path segments.

use crate::domain::folder::validate_folder_name;
use crate::domain::{normalize_secret_path, EnvironmentId, Folder, FolderId, ProjectId};
use crate::errors::{KeyplaneError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;

const FOLDER_COLUMNS: &str =
    "id, name, parent_id, environment_id, version, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct FolderRow {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub environment_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FolderRow> for Folder {
    fn from(row: FolderRow) -> Self {
        Self {
            id: FolderId::from_string(row.id),
            name: row.name,
            parent_id: row.parent_id.map(FolderId::from_string),
            environment_id: EnvironmentId::from_string(row.environment_id),
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for folder data access
#[derive(Debug, Clone)]
pub struct FolderRepository {
    pool: DbPool,
}

impl FolderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a child folder under `parent_id`.
    ///
    /// Fails with `BadRequest` for an invalid name or a sibling with the same
    /// name, and with `NotFound` if the parent is not in `environment_id`.
    #[instrument(skip(self), fields(environment_id = %environment_id, parent_id = %parent_id), name = "db_create_folder")]
    pub async fn create(
        &self,
        environment_id: &EnvironmentId,
        parent_id: &FolderId,
        name: &str,
    ) -> Result<Folder> {
        validate_folder_name(name).map_err(|msg| KeyplaneError::bad_request_field(msg, "name"))?;

        let parent = self
            .find_by_id(parent_id)
            .await?
            .filter(|parent| &parent.environment_id == environment_id)
            .ok_or_else(|| KeyplaneError::not_found("Folder", parent_id.as_str()))?;

        if self.find_child(&parent.id, name).await?.is_some() {
            return Err(KeyplaneError::bad_request_field(
                format!("Folder '{}' already exists", name),
                "name",
            ));
        }

        let now = Utc::now();
        let row = sqlx::query_as::<_, FolderRow>(&format!(
            "INSERT INTO secret_folders (id, name, parent_id, environment_id, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 1, $5, $5) RETURNING {FOLDER_COLUMNS}"
        ))
        .bind(FolderId::new().as_str())
        .bind(name)
        .bind(parent.id.as_str())
        .bind(environment_id.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_name = %name, "Failed to create folder");
            let err = KeyplaneError::database(e, format!("Failed to create folder '{}'", name));
            if err.is_unique_violation() {
                KeyplaneError::bad_request_field(format!("Folder '{}' already exists", name), "name")
            } else {
                err
            }
        })?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(folder_id = %id), name = "db_find_folder_by_id")]
    pub async fn find_by_id(&self, id: &FolderId) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM secret_folders WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_id = %id, "Failed to find folder");
            KeyplaneError::database(e, format!("Failed to find folder '{}'", id))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(environment_id = %environment_id), name = "db_find_root_folder")]
    pub async fn find_root(&self, environment_id: &EnvironmentId) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM secret_folders \
             WHERE environment_id = $1 AND parent_id IS NULL"
        ))
        .bind(environment_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %environment_id, "Failed to find root folder");
            KeyplaneError::database(e, format!("Failed to find root folder of '{}'", environment_id))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(parent_id = %parent_id), name = "db_find_child_folder")]
    pub async fn find_child(&self, parent_id: &FolderId, name: &str) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM secret_folders WHERE parent_id = $1 AND name = $2"
        ))
        .bind(parent_id.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, parent_id = %parent_id, "Failed to find child folder");
            KeyplaneError::database(e, format!("Failed to find folder '{}'", name))
        })?;

        Ok(row.map(Into::into))
    }

    /// Every folder of one environment, unordered
    #[instrument(skip(self), fields(environment_id = %environment_id), name = "db_find_folders_by_environment")]
    pub async fn find_by_environment(&self, environment_id: &EnvironmentId) -> Result<Vec<Folder>> {
        let rows = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM secret_folders WHERE environment_id = $1"
        ))
        .bind(environment_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %environment_id, "Failed to list folders");
            KeyplaneError::database(e, format!("Failed to list folders of '{}'", environment_id))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Find the folder at `secret_path` in the environment with slug
    /// `environment_slug`.
    ///
    /// The recursive walk only descends into children whose path is a prefix
    /// of the target, so the cost is bounded by the target depth.
    #[instrument(skip(self), fields(project_id = %project_id), name = "db_find_folder_by_secret_path")]
    pub async fn find_by_secret_path(
        &self,
        project_id: &ProjectId,
        environment_slug: &str,
        secret_path: &str,
    ) -> Result<Option<Folder>> {
        let target = normalize_secret_path(secret_path);

        let row = sqlx::query_as::<_, FolderRow>(
            r#"
            WITH RECURSIVE folder_tree (id, name, parent_id, environment_id, version, created_at, updated_at, path) AS (
                SELECT f.id, f.name, f.parent_id, f.environment_id, f.version, f.created_at, f.updated_at,
                       '/' AS path
                FROM secret_folders f
                JOIN environments e ON e.id = f.environment_id
                WHERE e.project_id = $1 AND e.slug = $2 AND f.parent_id IS NULL
                UNION ALL
                SELECT c.id, c.name, c.parent_id, c.environment_id, c.version, c.created_at, c.updated_at,
                       CASE WHEN t.path = '/' THEN '/' || c.name ELSE t.path || '/' || c.name END
                FROM secret_folders c
                JOIN folder_tree t ON c.parent_id = t.id
                WHERE substr(
                          $3 || '/',
                          1,
                          length(CASE WHEN t.path = '/' THEN '/' || c.name ELSE t.path || '/' || c.name END) + 1
                      ) = (CASE WHEN t.path = '/' THEN '/' || c.name ELSE t.path || '/' || c.name END) || '/'
            )
            SELECT id, name, parent_id, environment_id, version, created_at, updated_at
            FROM folder_tree
            WHERE path = $3
            LIMIT 1
            "#,
        )
        .bind(project_id.as_str())
        .bind(environment_slug)
        .bind(&target)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                error = %e,
                environment = %environment_slug,
                secret_path = %target,
                "Failed to find folder by secret path"
            );
            KeyplaneError::database(
                e,
                format!("Failed to find folder '{}' in '{}'", target, environment_slug),
            )
        })?;

        Ok(row.map(Into::into))
    }

    /// Delete a folder; descendants and their secrets cascade.
    ///
    /// The root folder cannot be deleted.
    #[instrument(skip(self), fields(folder_id = %id), name = "db_delete_folder")]
    pub async fn delete(&self, id: &FolderId) -> Result<Folder> {
        let folder =
            self.find_by_id(id).await?.ok_or_else(|| KeyplaneError::not_found("Folder", id.as_str()))?;

        if folder.is_root() {
            return Err(KeyplaneError::bad_request("Cannot delete the root folder"));
        }

        sqlx::query("DELETE FROM secret_folders WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, folder_id = %id, "Failed to delete folder");
                KeyplaneError::database(e, format!("Failed to delete folder '{}'", id))
            })?;

        tracing::info!(folder_id = %id, folder_name = %folder.name, "Deleted folder");
        Ok(folder)
    }

    /// Bump a folder's version after a direct write to its secrets
    #[instrument(skip(self), fields(folder_id = %id), name = "db_touch_folder")]
    pub async fn touch(&self, id: &FolderId) -> Result<()> {
        sqlx::query("UPDATE secret_folders SET version = version + 1, updated_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, folder_id = %id, "Failed to bump folder version");
                KeyplaneError::database(e, format!("Failed to update folder '{}'", id))
            })?;
        Ok(())
    }
}

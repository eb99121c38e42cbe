//! Project and environment repository
//!
//! Provisioning helpers for the tenancy rows the secret core hangs off.
//! Creating an environment also creates its root folder in the same
//! transaction, so every environment always has exactly one root.

use crate::domain::{EnvironmentId, FolderId, ProjectId, ROOT_FOLDER_NAME};
use crate::errors::{KeyplaneError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct ProjectRow {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct EnvironmentRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

/// Project data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectData {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Environment data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentData {
    pub id: EnvironmentId,
    pub project_id: ProjectId,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl From<ProjectRow> for ProjectData {
    fn from(row: ProjectRow) -> Self {
        Self { id: ProjectId::from_string(row.id), name: row.name, created_at: row.created_at }
    }
}

impl From<EnvironmentRow> for EnvironmentData {
    fn from(row: EnvironmentRow) -> Self {
        Self {
            id: EnvironmentId::from_string(row.id),
            project_id: ProjectId::from_string(row.project_id),
            name: row.name,
            slug: row.slug,
            created_at: row.created_at,
        }
    }
}

/// Repository for projects and environments
#[derive(Debug, Clone)]
pub struct EnvironmentRepository {
    pool: DbPool,
}

impl EnvironmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), name = "db_create_project")]
    pub async fn create_project(&self, name: &str) -> Result<ProjectData> {
        if name.trim().is_empty() {
            return Err(KeyplaneError::bad_request_field("Project name cannot be empty", "name"));
        }

        let row = sqlx::query_as::<_, ProjectRow>(
            "INSERT INTO projects (id, name, created_at, updated_at) VALUES ($1, $2, $3, $3) \
             RETURNING id, name, created_at",
        )
        .bind(ProjectId::new().as_str())
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_name = %name, "Failed to create project");
            KeyplaneError::database(e, format!("Failed to create project '{}'", name))
        })?;

        Ok(row.into())
    }

    /// Create an environment together with its root folder
    #[instrument(skip(self), fields(project_id = %project_id), name = "db_create_environment")]
    pub async fn create_environment(
        &self,
        project_id: &ProjectId,
        name: &str,
        slug: &str,
    ) -> Result<EnvironmentData> {
        if slug.trim().is_empty() || slug.contains('.') || slug.contains('/') {
            return Err(KeyplaneError::bad_request_field(
                format!("Invalid environment slug '{}'", slug),
                "slug",
            ));
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to begin environment transaction"))?;

        let row = sqlx::query_as::<_, EnvironmentRow>(
            "INSERT INTO environments (id, project_id, name, slug, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             RETURNING id, project_id, name, slug, created_at",
        )
        .bind(EnvironmentId::new().as_str())
        .bind(project_id.as_str())
        .bind(name)
        .bind(slug)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, slug = %slug, "Failed to create environment");
            let err = KeyplaneError::database(e, format!("Failed to create environment '{}'", slug));
            if err.is_unique_violation() {
                KeyplaneError::bad_request_field(
                    format!("Environment '{}' already exists in project", slug),
                    "slug",
                )
            } else {
                err
            }
        })?;

        sqlx::query(
            "INSERT INTO secret_folders (id, name, parent_id, environment_id, version, created_at, updated_at) \
             VALUES ($1, $2, NULL, $3, 1, $4, $4)",
        )
        .bind(FolderId::new().as_str())
        .bind(ROOT_FOLDER_NAME)
        .bind(&row.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %row.id, "Failed to create root folder");
            KeyplaneError::database(e, format!("Failed to create root folder for '{}'", slug))
        })?;

        tx.commit()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to commit environment creation"))?;

        tracing::info!(environment_id = %row.id, slug = %slug, "Created environment with root folder");
        Ok(row.into())
    }

    #[instrument(skip(self), fields(project_id = %project_id), name = "db_find_environment_by_slug")]
    pub async fn find_by_slug(
        &self,
        project_id: &ProjectId,
        slug: &str,
    ) -> Result<Option<EnvironmentData>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, project_id, name, slug, created_at FROM environments \
             WHERE project_id = $1 AND slug = $2",
        )
        .bind(project_id.as_str())
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, slug = %slug, "Failed to find environment by slug");
            KeyplaneError::database(e, format!("Failed to find environment '{}'", slug))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(environment_id = %id), name = "db_find_environment_by_id")]
    pub async fn find_by_id(&self, id: &EnvironmentId) -> Result<Option<EnvironmentData>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, project_id, name, slug, created_at FROM environments WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %id, "Failed to find environment");
            KeyplaneError::database(e, format!("Failed to find environment '{}'", id))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(project_id = %project_id), name = "db_list_environments")]
    pub async fn list_by_project(&self, project_id: &ProjectId) -> Result<Vec<EnvironmentData>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, project_id, name, slug, created_at FROM environments \
             WHERE project_id = $1 ORDER BY slug",
        )
        .bind(project_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to list environments");
            KeyplaneError::database(e, format!("Failed to list environments of '{}'", project_id))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Resolve an environment slug or fail with `NotFound`
    pub async fn require_by_slug(
        &self,
        project_id: &ProjectId,
        slug: &str,
    ) -> Result<EnvironmentData> {
        self.find_by_slug(project_id, slug)
            .await?
            .ok_or_else(|| KeyplaneError::not_found("Environment", slug))
    }
}

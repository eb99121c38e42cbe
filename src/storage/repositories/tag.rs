//! Tag repository

use crate::domain::{ProjectId, Tag, TagId};
use crate::errors::{KeyplaneError, Result};
use crate::storage::DbPool;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct TagRow {
    pub id: String,
    pub project_id: String,
    pub slug: String,
    pub color: Option<String>,
}

impl From<TagRow> for Tag {
    fn from(row: TagRow) -> Self {
        Self {
            id: TagId::from_string(row.id),
            project_id: ProjectId::from_string(row.project_id),
            slug: row.slug,
            color: row.color,
        }
    }
}

/// Repository for project scoped tags
#[derive(Debug, Clone)]
pub struct TagRepository {
    pool: DbPool,
}

impl TagRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), fields(project_id = %project_id), name = "db_create_tag")]
    pub async fn create(
        &self,
        project_id: &ProjectId,
        slug: &str,
        color: Option<&str>,
    ) -> Result<Tag> {
        if slug.trim().is_empty() {
            return Err(KeyplaneError::bad_request_field("Tag slug cannot be empty", "slug"));
        }

        let row = sqlx::query_as::<_, TagRow>(
            "INSERT INTO tags (id, project_id, slug, color, created_at) VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, project_id, slug, color",
        )
        .bind(TagId::new().as_str())
        .bind(project_id.as_str())
        .bind(slug)
        .bind(color)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, tag_slug = %slug, "Failed to create tag");
            let err = KeyplaneError::database(e, format!("Failed to create tag '{}'", slug));
            if err.is_unique_violation() {
                KeyplaneError::bad_request_field(format!("Tag '{}' already exists", slug), "slug")
            } else {
                err
            }
        })?;

        Ok(row.into())
    }

    /// Load tags by id, restricted to one project. Ids from other projects are
    /// silently absent from the result.
    #[instrument(skip(self, ids), fields(project_id = %project_id, tag_count = ids.len()), name = "db_find_tags_by_ids")]
    pub async fn find_by_ids_in_project(
        &self,
        project_id: &ProjectId,
        ids: &[TagId],
    ) -> Result<Vec<Tag>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, project_id, slug, color FROM tags WHERE project_id = ");
        query.push_bind(project_id.as_str()).push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") ORDER BY slug");

        let rows = query.build_query_as::<TagRow>().fetch_all(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to load tags");
            KeyplaneError::database(e, "Failed to load tags by id")
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Load tags by id and fail with `BadRequest` if any is missing from the project
    pub async fn require_in_project(&self, project_id: &ProjectId, ids: &[TagId]) -> Result<Vec<Tag>> {
        let tags = self.find_by_ids_in_project(project_id, ids).await?;
        let missing: Vec<&str> = ids
            .iter()
            .filter(|id| !tags.iter().any(|tag| &tag.id == *id))
            .map(|id| id.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(KeyplaneError::bad_request_field(
                format!("Tag not found in project: {}", missing.join(", ")),
                "tag_ids",
            ));
        }

        Ok(tags)
    }

    #[instrument(skip(self), fields(project_id = %project_id), name = "db_list_tags")]
    pub async fn list_by_project(&self, project_id: &ProjectId) -> Result<Vec<Tag>> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT id, project_id, slug, color FROM tags WHERE project_id = $1 ORDER BY slug",
        )
        .bind(project_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to list tags");
            KeyplaneError::database(e, "Failed to list tags")
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

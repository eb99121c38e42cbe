//! Secret version repository
//!
//! Append-only history. Rows are written alongside every create and update in
//! the same transaction and only removed by the retention job or by deleting
//! the owning secret.

use crate::domain::{
    FolderId, ProjectId, ReminderSettings, SecretId, SecretType, SecretVersion, SecretVersionId,
    Tag, TagId, UserId,
};
use crate::errors::{KeyplaneError, Result};
use crate::storage::{DbPool, DbTransaction};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct SecretVersionRow {
    pub id: String,
    pub secret_id: String,
    pub folder_id: String,
    pub key: String,
    #[sqlx(rename = "type")]
    pub secret_type: String,
    pub user_id: Option<String>,
    pub encrypted_value: Vec<u8>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub version: i64,
    pub skip_multiline_encoding: bool,
    pub reminder_repeat_days: Option<i64>,
    pub reminder_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SecretVersionRow> for SecretVersion {
    type Error = KeyplaneError;

    fn try_from(row: SecretVersionRow) -> Result<Self> {
        let secret_type = SecretType::from_str(&row.secret_type).map_err(|e| {
            KeyplaneError::internal(format!("Invalid secret type '{}': {}", row.secret_type, e))
        })?;

        Ok(SecretVersion {
            id: SecretVersionId::from_string(row.id),
            secret_id: SecretId::from_string(row.secret_id),
            folder_id: FolderId::from_string(row.folder_id),
            key: row.key,
            secret_type,
            user_id: row.user_id.map(UserId::from_string),
            encrypted_value: row.encrypted_value,
            encrypted_comment: row.encrypted_comment,
            version: row.version,
            skip_multiline_encoding: row.skip_multiline_encoding,
            reminder: ReminderSettings {
                repeat_days: row.reminder_repeat_days,
                note: row.reminder_note,
            },
            tags: Vec::new(),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct VersionTagRow {
    pub secret_version_id: String,
    pub id: String,
    pub project_id: String,
    pub slug: String,
    pub color: Option<String>,
}

/// Repository for secret version history
#[derive(Debug, Clone)]
pub struct SecretVersionRepository {
    pool: DbPool,
}

impl SecretVersionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append version rows and their tag snapshots within a transaction
    #[instrument(skip(self, tx, versions), fields(version_count = versions.len()), name = "db_insert_secret_versions")]
    pub async fn insert_many_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        versions: &[SecretVersion],
    ) -> Result<()> {
        for version in versions {
            sqlx::query(
                "INSERT INTO secret_versions (id, secret_id, folder_id, key, type, user_id, encrypted_value, \
                 encrypted_comment, version, skip_multiline_encoding, reminder_repeat_days, reminder_note, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(version.id.as_str())
            .bind(version.secret_id.as_str())
            .bind(version.folder_id.as_str())
            .bind(&version.key)
            .bind(version.secret_type.as_str())
            .bind(version.user_id.as_ref().map(|id| id.as_str()))
            .bind(&version.encrypted_value)
            .bind(version.encrypted_comment.as_deref())
            .bind(version.version)
            .bind(version.skip_multiline_encoding)
            .bind(version.reminder.repeat_days)
            .bind(version.reminder.note.as_deref())
            .bind(version.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    secret_id = %version.secret_id,
                    version = version.version,
                    "Failed to insert secret version"
                );
                KeyplaneError::database(
                    e,
                    format!("Failed to insert version {} of secret '{}'", version.version, version.key),
                )
            })?;

            for tag in &version.tags {
                sqlx::query(
                    "INSERT OR IGNORE INTO secret_version_tags (secret_version_id, tag_id) VALUES ($1, $2)",
                )
                .bind(version.id.as_str())
                .bind(tag.id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, secret_version_id = %version.id, "Failed to snapshot version tag");
                    KeyplaneError::database(e, "Failed to snapshot version tags")
                })?;
            }
        }

        Ok(())
    }

    /// Versions of one secret, newest first
    #[instrument(skip(self), fields(secret_id = %secret_id), name = "db_find_secret_versions")]
    pub async fn find_by_secret_id(
        &self,
        secret_id: &SecretId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SecretVersion>> {
        let rows = sqlx::query_as::<_, SecretVersionRow>(
            "SELECT id, secret_id, folder_id, key, type, user_id, encrypted_value, encrypted_comment, \
             version, skip_multiline_encoding, reminder_repeat_days, reminder_note, created_at \
             FROM secret_versions WHERE secret_id = $1 ORDER BY version DESC LIMIT $2 OFFSET $3",
        )
        .bind(secret_id.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %secret_id, "Failed to list secret versions");
            KeyplaneError::database(e, format!("Failed to list versions of '{}'", secret_id))
        })?;

        let mut versions = rows.into_iter().map(SecretVersion::try_from).collect::<Result<Vec<_>>>()?;
        self.attach_tags(&mut versions).await?;
        Ok(versions)
    }

    async fn attach_tags(&self, versions: &mut [SecretVersion]) -> Result<()> {
        if versions.is_empty() {
            return Ok(());
        }

        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT vt.secret_version_id, t.id, t.project_id, t.slug, t.color \
             FROM secret_version_tags vt JOIN tags t ON t.id = vt.tag_id \
             WHERE vt.secret_version_id IN (",
        );
        let mut separated = builder.separated(", ");
        for version in versions.iter() {
            separated.push_bind(version.id.as_str().to_string());
        }
        separated.push_unseparated(") ORDER BY t.slug");

        let rows = builder.build_query_as::<VersionTagRow>().fetch_all(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to load version tags");
            KeyplaneError::database(e, "Failed to load version tags")
        })?;

        let mut by_version: HashMap<String, Vec<Tag>> = HashMap::new();
        for row in rows {
            by_version.entry(row.secret_version_id).or_default().push(Tag {
                id: TagId::from_string(row.id),
                project_id: ProjectId::from_string(row.project_id),
                slug: row.slug,
                color: row.color,
            });
        }

        for version in versions.iter_mut() {
            if let Some(tags) = by_version.remove(version.id.as_str()) {
                version.tags = tags;
            }
        }

        Ok(())
    }

    /// Delete all but the newest `keep` versions of every secret in a project.
    ///
    /// Returns the number of rows removed.
    #[instrument(skip(self), fields(project_id = %project_id), name = "db_prune_secret_versions")]
    pub async fn prune_excess_versions(&self, project_id: &ProjectId, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM secret_versions
            WHERE id IN (
                SELECT id FROM (
                    SELECT v.id,
                           ROW_NUMBER() OVER (PARTITION BY v.secret_id ORDER BY v.version DESC) AS row_num
                    FROM secret_versions v
                    JOIN secrets s ON s.id = v.secret_id
                    JOIN secret_folders f ON f.id = s.folder_id
                    JOIN environments e ON e.id = f.environment_id
                    WHERE e.project_id = $1
                )
                WHERE row_num > $2
            )
            "#,
        )
        .bind(project_id.as_str())
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to prune secret versions");
            KeyplaneError::database(e, format!("Failed to prune versions of project '{}'", project_id))
        })?;

        if result.rows_affected() > 0 {
            tracing::info!(
                project_id = %project_id,
                keep = keep,
                pruned = result.rows_affected(),
                "Pruned excess secret versions"
            );
        }

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(secret_id = %secret_id), name = "db_count_secret_versions")]
    pub async fn count_by_secret_id(&self, secret_id: &SecretId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM secret_versions WHERE secret_id = $1")
            .bind(secret_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to count secret versions");
                KeyplaneError::database(e, "Failed to count secret versions")
            })
    }
}

//! Secret repository
//!
//! Row-level access to `secrets` and its tag and metadata join tables. Write
//! methods take an open transaction so the secret store can compose a whole
//! bulk call (secret rows, versions, references, tags) into one commit.
//! Values arrive here already encrypted.

use crate::domain::{
    FolderId, ReminderSettings, ResourceMetadata, Secret, SecretId, SecretType, Tag, TagId, UserId,
};
use crate::errors::{KeyplaneError, Result};
use crate::storage::{DbPool, DbTransaction};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::instrument;

const SECRET_COLUMNS: &str = "id, folder_id, key, type, user_id, encrypted_value, encrypted_comment, \
     version, skip_multiline_encoding, reminder_repeat_days, reminder_note, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct SecretRow {
    pub id: String,
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
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SecretRow> for Secret {
    type Error = KeyplaneError;

    fn try_from(row: SecretRow) -> Result<Self> {
        let secret_type = SecretType::from_str(&row.secret_type).map_err(|e| {
            KeyplaneError::internal(format!("Invalid secret type '{}': {}", row.secret_type, e))
        })?;

        Ok(Secret {
            id: SecretId::from_string(row.id),
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
            metadata: Vec::new(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A secret row joined with at most one tag and one metadata entry
#[derive(Debug, Clone, FromRow)]
struct AnnotatedSecretRow {
    #[sqlx(flatten)]
    pub secret: SecretRow,
    pub tag_id: Option<String>,
    pub tag_project_id: Option<String>,
    pub tag_slug: Option<String>,
    pub tag_color: Option<String>,
    pub metadata_key: Option<String>,
    pub metadata_value: Option<String>,
}

/// Collapse joined rows into one secret per id, preserving row order
fn group_annotated_rows(rows: Vec<AnnotatedSecretRow>) -> Result<Vec<Secret>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut secrets: Vec<Secret> = Vec::new();

    for row in rows {
        let position = match index.get(&row.secret.id) {
            Some(position) => *position,
            None => {
                index.insert(row.secret.id.clone(), secrets.len());
                secrets.push(Secret::try_from(row.secret.clone())?);
                secrets.len() - 1
            }
        };
        let secret = &mut secrets[position];

        if let (Some(id), Some(project_id), Some(slug)) =
            (row.tag_id, row.tag_project_id, row.tag_slug)
        {
            let id = TagId::from_string(id);
            if !secret.tags.iter().any(|tag| tag.id == id) {
                secret.tags.push(Tag {
                    id,
                    project_id: project_id.into(),
                    slug,
                    color: row.tag_color,
                });
            }
        }

        if let (Some(key), Some(value)) = (row.metadata_key, row.metadata_value) {
            let entry = ResourceMetadata { key, value };
            if !secret.metadata.contains(&entry) {
                secret.metadata.push(entry);
            }
        }
    }

    Ok(secrets)
}

/// Which personal rows a read may see
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecretVisibility {
    /// Shared rows only
    #[default]
    Shared,
    /// Shared rows plus the personal rows of one user
    SharedAndPersonalOf(UserId),
    /// Every row, including other users' personal overrides
    All,
}

/// Filters and pagination for secret reads
#[derive(Debug, Clone, Default)]
pub struct SecretQuery {
    /// Case-insensitive substring match on the key
    pub search: Option<String>,
    /// Restrict to these exact keys
    pub keys: Option<Vec<String>>,
    /// Secrets carrying any of these tag slugs
    pub tag_slugs: Vec<String>,
    /// Secrets carrying all of these metadata pairs
    pub metadata: Vec<ResourceMetadata>,
    pub visibility: SecretVisibility,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl SecretQuery {
    pub fn all() -> Self {
        Self { visibility: SecretVisibility::All, ..Default::default() }
    }

    pub fn for_user(user_id: Option<&UserId>) -> Self {
        let visibility = match user_id {
            Some(user_id) => SecretVisibility::SharedAndPersonalOf(user_id.clone()),
            None => SecretVisibility::Shared,
        };
        Self { visibility, ..Default::default() }
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = Some(keys);
        self
    }
}

/// Escape `LIKE` wildcards so a search term is matched literally
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Build the ranked, left-joined read over one or more folders.
///
/// The rank is a `DENSE_RANK` over `(key, type, id)`, so pagination counts
/// secrets rather than joined rows and a page boundary never splits a secret.
fn build_secret_query<'a>(folder_ids: &[FolderId], query: &SecretQuery) -> QueryBuilder<'a, Sqlite> {
    let mut builder: QueryBuilder<'a, Sqlite> = QueryBuilder::new(
        "SELECT * FROM (SELECT s.id, s.folder_id, s.key, s.type, s.user_id, s.encrypted_value, \
         s.encrypted_comment, s.version, s.skip_multiline_encoding, s.reminder_repeat_days, \
         s.reminder_note, s.created_at, s.updated_at, \
         t.id AS tag_id, t.project_id AS tag_project_id, t.slug AS tag_slug, t.color AS tag_color, \
         m.key AS metadata_key, m.value AS metadata_value, \
         DENSE_RANK() OVER (ORDER BY s.key, s.type DESC, s.id) AS secret_rank \
         FROM secrets s \
         LEFT JOIN secret_tags st ON st.secret_id = s.id \
         LEFT JOIN tags t ON t.id = st.tag_id \
         LEFT JOIN secret_metadata m ON m.secret_id = s.id \
         WHERE s.folder_id IN (",
    );
    let mut separated = builder.separated(", ");
    for folder_id in folder_ids {
        separated.push_bind(folder_id.as_str().to_string());
    }
    separated.push_unseparated(")");

    match &query.visibility {
        SecretVisibility::Shared => {
            builder.push(" AND s.type = 'shared'");
        }
        SecretVisibility::SharedAndPersonalOf(user_id) => {
            builder.push(" AND (s.type = 'shared' OR (s.type = 'personal' AND s.user_id = ");
            builder.push_bind(user_id.as_str().to_string());
            builder.push("))");
        }
        SecretVisibility::All => {}
    }

    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        builder.push(" AND s.key LIKE ");
        builder.push_bind(escape_like(search));
        builder.push(" ESCAPE '\\'");
    }

    if let Some(keys) = &query.keys {
        if keys.is_empty() {
            builder.push(" AND 0");
        } else {
            builder.push(" AND s.key IN (");
            let mut separated = builder.separated(", ");
            for key in keys {
                separated.push_bind(key.clone());
            }
            separated.push_unseparated(")");
        }
    }

    if !query.tag_slugs.is_empty() {
        builder.push(
            " AND s.id IN (SELECT fst.secret_id FROM secret_tags fst \
             JOIN tags ft ON ft.id = fst.tag_id WHERE ft.slug IN (",
        );
        let mut separated = builder.separated(", ");
        for slug in &query.tag_slugs {
            separated.push_bind(slug.clone());
        }
        separated.push_unseparated("))");
    }

    for entry in &query.metadata {
        builder.push(
            " AND EXISTS (SELECT 1 FROM secret_metadata fm WHERE fm.secret_id = s.id AND fm.key = ",
        );
        builder.push_bind(entry.key.clone());
        builder.push(" AND fm.value = ");
        builder.push_bind(entry.value.clone());
        builder.push(")");
    }

    builder.push(") ranked");

    let offset = query.offset.unwrap_or(0).max(0);
    builder.push(" WHERE secret_rank > ");
    builder.push_bind(offset);
    if let Some(limit) = query.limit {
        builder.push(" AND secret_rank <= ");
        builder.push_bind(offset + limit.max(0));
    }

    builder.push(" ORDER BY secret_rank, tag_slug, metadata_key");
    builder
}

async fn fetch_secrets(
    conn: &mut SqliteConnection,
    folder_ids: &[FolderId],
    query: &SecretQuery,
) -> Result<Vec<Secret>> {
    if folder_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = build_secret_query(folder_ids, query);
    let rows = builder.build_query_as::<AnnotatedSecretRow>().fetch_all(conn).await.map_err(|e| {
        tracing::error!(error = %e, folder_count = folder_ids.len(), "Failed to query secrets");
        KeyplaneError::database(e, "Failed to query secrets")
    })?;

    group_annotated_rows(rows)
}

/// Fields of a secret row to insert
#[derive(Debug, Clone)]
pub struct NewSecretRecord {
    pub key: String,
    pub secret_type: SecretType,
    pub user_id: Option<UserId>,
    pub encrypted_value: Vec<u8>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub skip_multiline_encoding: bool,
    pub reminder: ReminderSettings,
}

/// Field changes applied by an update; `None` leaves a column untouched
#[derive(Debug, Clone, Default)]
pub struct SecretChanges {
    pub key: Option<String>,
    pub encrypted_value: Option<Vec<u8>>,
    pub encrypted_comment: Option<Option<Vec<u8>>>,
    pub skip_multiline_encoding: Option<bool>,
    pub reminder: Option<ReminderSettings>,
}

/// Repository for secret data access
#[derive(Debug, Clone)]
pub struct SecretRepository {
    pool: DbPool,
}

impl SecretRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Begin a new transaction.
    pub async fn begin(&self) -> Result<DbTransaction<'static>> {
        self.pool
            .begin()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to begin secret transaction"))
    }

    /// Insert one secret row within a transaction; version starts at 1.
    #[instrument(skip(self, tx, record), fields(folder_id = %folder_id, secret_key = %record.key), name = "db_insert_secret")]
    pub async fn insert_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        folder_id: &FolderId,
        record: &NewSecretRecord,
    ) -> Result<Secret> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, SecretRow>(&format!(
            "INSERT INTO secrets (id, folder_id, key, type, user_id, encrypted_value, encrypted_comment, \
             version, skip_multiline_encoding, reminder_repeat_days, reminder_note, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8, $9, $10, $11, $11) RETURNING {SECRET_COLUMNS}"
        ))
        .bind(SecretId::new().as_str())
        .bind(folder_id.as_str())
        .bind(&record.key)
        .bind(record.secret_type.as_str())
        .bind(record.user_id.as_ref().map(|id| id.as_str()))
        .bind(&record.encrypted_value)
        .bind(record.encrypted_comment.as_deref())
        .bind(record.skip_multiline_encoding)
        .bind(record.reminder.repeat_days)
        .bind(record.reminder.note.as_deref())
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_key = %record.key, "Failed to insert secret");
            let err =
                KeyplaneError::database(e, format!("Failed to insert secret '{}'", record.key));
            if err.is_unique_violation() {
                KeyplaneError::bad_request_field(
                    format!("Secret already exists: {}", record.key),
                    "secret_key",
                )
            } else {
                err
            }
        })?;

        row.try_into()
    }

    /// Apply changes to one secret and bump its version by exactly one
    #[instrument(skip(self, tx, changes), fields(secret_id = %secret_id), name = "db_update_secret")]
    pub async fn update_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        secret_id: &SecretId,
        changes: &SecretChanges,
    ) -> Result<Secret> {
        let comment_changed = changes.encrypted_comment.is_some();
        let new_comment = changes.encrypted_comment.clone().flatten();
        let reminder_changed = changes.reminder.is_some();
        let reminder = changes.reminder.clone().unwrap_or_default();

        let row = sqlx::query_as::<_, SecretRow>(&format!(
            "UPDATE secrets SET \
                key = COALESCE($2, key), \
                encrypted_value = COALESCE($3, encrypted_value), \
                encrypted_comment = CASE WHEN $4 THEN $5 ELSE encrypted_comment END, \
                skip_multiline_encoding = COALESCE($6, skip_multiline_encoding), \
                reminder_repeat_days = CASE WHEN $7 THEN $8 ELSE reminder_repeat_days END, \
                reminder_note = CASE WHEN $7 THEN $9 ELSE reminder_note END, \
                version = version + 1, \
                updated_at = $10 \
             WHERE id = $1 RETURNING {SECRET_COLUMNS}"
        ))
        .bind(secret_id.as_str())
        .bind(changes.key.as_deref())
        .bind(changes.encrypted_value.as_deref())
        .bind(comment_changed)
        .bind(new_comment)
        .bind(changes.skip_multiline_encoding)
        .bind(reminder_changed)
        .bind(reminder.repeat_days)
        .bind(reminder.note)
        .bind(Utc::now())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %secret_id, "Failed to update secret");
            let err = KeyplaneError::database(e, format!("Failed to update secret '{}'", secret_id));
            if err.is_unique_violation() {
                KeyplaneError::bad_request_field(
                    format!(
                        "Secret already exists: {}",
                        changes.key.as_deref().unwrap_or(secret_id.as_str())
                    ),
                    "new_secret_key",
                )
            } else {
                err
            }
        })?
        .ok_or_else(|| KeyplaneError::not_found("Secret", secret_id.as_str()))?;

        row.try_into()
    }

    #[instrument(skip(self, tx, ids), fields(secret_count = ids.len()), name = "db_delete_secrets")]
    pub async fn delete_by_ids_in_tx(&self, tx: &mut DbTransaction<'_>, ids: &[SecretId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM secrets WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&mut **tx).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to delete secrets");
            KeyplaneError::database(e, "Failed to delete secrets")
        })?;

        Ok(result.rows_affected())
    }

    /// Replace the tag set of a secret
    #[instrument(skip(self, tx, tag_ids), fields(secret_id = %secret_id), name = "db_replace_secret_tags")]
    pub async fn replace_tags_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        secret_id: &SecretId,
        tag_ids: &[TagId],
    ) -> Result<()> {
        sqlx::query("DELETE FROM secret_tags WHERE secret_id = $1")
            .bind(secret_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to clear secret tags");
                KeyplaneError::database(e, "Failed to clear secret tags")
            })?;

        for tag_id in tag_ids {
            sqlx::query("INSERT OR IGNORE INTO secret_tags (secret_id, tag_id) VALUES ($1, $2)")
                .bind(secret_id.as_str())
                .bind(tag_id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, secret_id = %secret_id, tag_id = %tag_id, "Failed to attach tag");
                    KeyplaneError::database(e, format!("Failed to attach tag '{}'", tag_id))
                })?;
        }

        Ok(())
    }

    /// Replace the metadata set of a secret
    #[instrument(skip(self, tx, metadata), fields(secret_id = %secret_id), name = "db_replace_secret_metadata")]
    pub async fn replace_metadata_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        secret_id: &SecretId,
        metadata: &[ResourceMetadata],
    ) -> Result<()> {
        sqlx::query("DELETE FROM secret_metadata WHERE secret_id = $1")
            .bind(secret_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to clear secret metadata");
                KeyplaneError::database(e, "Failed to clear secret metadata")
            })?;

        for entry in metadata {
            sqlx::query("INSERT INTO secret_metadata (secret_id, key, value) VALUES ($1, $2, $3)")
                .bind(secret_id.as_str())
                .bind(&entry.key)
                .bind(&entry.value)
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, secret_id = %secret_id, "Failed to insert secret metadata");
                    KeyplaneError::database(e, "Failed to insert secret metadata")
                })?;
        }

        Ok(())
    }

    /// Read secrets inside an open transaction
    pub async fn find_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        folder_id: &FolderId,
        query: &SecretQuery,
    ) -> Result<Vec<Secret>> {
        fetch_secrets(&mut **tx, std::slice::from_ref(folder_id), query).await
    }

    /// Read secrets by id inside an open transaction, annotated with tags and metadata
    pub async fn find_by_ids_in_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        ids: &[SecretId],
    ) -> Result<Vec<Secret>> {
        find_by_ids(&mut **tx, ids).await
    }

    #[instrument(skip(self, query), fields(folder_id = %folder_id), name = "db_find_secrets_by_folder")]
    pub async fn find_by_folder_id(&self, folder_id: &FolderId, query: &SecretQuery) -> Result<Vec<Secret>> {
        self.find_by_folder_ids(std::slice::from_ref(folder_id), query).await
    }

    #[instrument(skip(self, folder_ids, query), fields(folder_count = folder_ids.len()), name = "db_find_secrets_by_folders")]
    pub async fn find_by_folder_ids(
        &self,
        folder_ids: &[FolderId],
        query: &SecretQuery,
    ) -> Result<Vec<Secret>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to acquire connection"))?;
        fetch_secrets(&mut conn, folder_ids, query).await
    }

    /// Secrets in one folder with any of the given keys
    #[instrument(skip(self, keys), fields(folder_id = %folder_id, key_count = keys.len()), name = "db_find_secrets_by_keys")]
    pub async fn find_by_secret_keys(
        &self,
        folder_id: &FolderId,
        keys: &[String],
        visibility: SecretVisibility,
    ) -> Result<Vec<Secret>> {
        let query = SecretQuery { keys: Some(keys.to_vec()), visibility, ..Default::default() };
        self.find_by_folder_id(folder_id, &query).await
    }

    #[instrument(skip(self, ids), fields(secret_count = ids.len()), name = "db_find_secrets_by_ids")]
    pub async fn find_by_ids(&self, ids: &[SecretId]) -> Result<Vec<Secret>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| KeyplaneError::database(e, "Failed to acquire connection"))?;
        find_by_ids(&mut conn, ids).await
    }
}

async fn find_by_ids(conn: &mut SqliteConnection, ids: &[SecretId]) -> Result<Vec<Secret>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT s.id, s.folder_id, s.key, s.type, s.user_id, s.encrypted_value, s.encrypted_comment, \
         s.version, s.skip_multiline_encoding, s.reminder_repeat_days, s.reminder_note, s.created_at, \
         s.updated_at, t.id AS tag_id, t.project_id AS tag_project_id, t.slug AS tag_slug, \
         t.color AS tag_color, m.key AS metadata_key, m.value AS metadata_value \
         FROM secrets s \
         LEFT JOIN secret_tags st ON st.secret_id = s.id \
         LEFT JOIN tags t ON t.id = st.tag_id \
         LEFT JOIN secret_metadata m ON m.secret_id = s.id \
         WHERE s.id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(") ORDER BY s.key, s.id, t.slug, m.key");

    let rows = builder.build_query_as::<AnnotatedSecretRow>().fetch_all(conn).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to load secrets by id");
        KeyplaneError::database(e, "Failed to load secrets by id")
    })?;

    group_annotated_rows(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_like_wildcards() {
        assert_eq!(escape_like("DB"), "%DB%");
        assert_eq!(escape_like("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn query_for_user_selects_visibility() {
        assert_eq!(SecretQuery::for_user(None).visibility, SecretVisibility::Shared);
        let user = UserId::from_str_unchecked("u1");
        assert_eq!(
            SecretQuery::for_user(Some(&user)).visibility,
            SecretVisibility::SharedAndPersonalOf(user)
        );
        assert_eq!(SecretQuery::all().visibility, SecretVisibility::All);
    }

    #[test]
    fn built_query_contains_filters() {
        let query = SecretQuery {
            search: Some("db".into()),
            tag_slugs: vec!["prod".into()],
            metadata: vec![ResourceMetadata::new("team", "core")],
            limit: Some(10),
            ..SecretQuery::all()
        };
        let builder = build_secret_query(&[FolderId::from_str_unchecked("f1")], &query);
        let sql = builder.sql();
        assert!(sql.contains("DENSE_RANK() OVER"));
        assert!(sql.contains("s.key LIKE"));
        assert!(sql.contains("ft.slug IN"));
        assert!(sql.contains("fm.key ="));
        assert!(sql.contains("secret_rank <="));
        assert!(!sql.contains("s.type = 'shared'"));
    }
}

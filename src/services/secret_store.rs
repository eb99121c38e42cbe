//! Transactional secret store
//!
//! Bulk insert, update and delete against a single folder. Every call runs in
//! one transaction that writes the secret rows, one version snapshot per
//! mutation, the reference edges derived from the plaintext value, and the
//! tag and metadata associations. Validation happens before the first write.
//! Reminder scheduling runs after commit and never fails the call.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, Instrument};

use crate::{
    domain::{
        reference_edges, FolderId, ProjectId, ReminderSettings, ResourceMetadata, Secret, SecretId,
        SecretType, SecretVersion, TagId, UserId,
    },
    errors::{KeyplaneError, Result},
    observability::MetricsRecorder,
    services::collaborators::{run_advisory, ReminderScheduler},
    services::secret_encryption::SecretCipher,
    storage::{
        DbPool, DbTransaction, NewSecretRecord, SecretChanges, SecretQuery,
        SecretReferenceRepository, SecretRepository, SecretVersionRepository, SecretVisibility,
        TagRepository,
    },
};

/// Resolved location every store call operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderContext {
    pub project_id: ProjectId,
    /// Environment slug
    pub environment: String,
    /// Normalized folder path
    pub secret_path: String,
    pub folder_id: FolderId,
}

/// Plaintext input for a new secret
#[derive(Debug, Clone)]
pub struct SecretInput {
    pub key: String,
    pub secret_type: SecretType,
    pub user_id: Option<UserId>,
    pub value: String,
    pub comment: Option<String>,
    pub skip_multiline_encoding: bool,
    pub reminder: ReminderSettings,
    pub tag_ids: Vec<TagId>,
    pub metadata: Vec<ResourceMetadata>,
}

impl SecretInput {
    /// A shared secret with no comment, tags or metadata
    pub fn shared(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret_type: SecretType::Shared,
            user_id: None,
            value: value.into(),
            comment: None,
            skip_multiline_encoding: false,
            reminder: ReminderSettings::default(),
            tag_ids: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// A personal override owned by `user_id`
    pub fn personal(key: impl Into<String>, value: impl Into<String>, user_id: UserId) -> Self {
        Self { secret_type: SecretType::Personal, user_id: Some(user_id), ..Self::shared(key, value) }
    }
}

/// Identifies exactly one secret within a folder
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretFilter {
    pub key: String,
    pub secret_type: SecretType,
    pub user_id: Option<UserId>,
}

impl SecretFilter {
    pub fn shared(key: impl Into<String>) -> Self {
        Self { key: key.into(), secret_type: SecretType::Shared, user_id: None }
    }

    pub fn personal(key: impl Into<String>, user_id: UserId) -> Self {
        Self { key: key.into(), secret_type: SecretType::Personal, user_id: Some(user_id) }
    }

    pub fn matches(&self, secret: &Secret) -> bool {
        secret.key == self.key
            && secret.secret_type == self.secret_type
            && (self.secret_type == SecretType::Shared || secret.user_id == self.user_id)
    }
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct SecretUpdate {
    pub new_key: Option<String>,
    pub value: Option<String>,
    pub comment: Option<String>,
    pub skip_multiline_encoding: Option<bool>,
    pub reminder: Option<ReminderSettings>,
    pub tag_ids: Option<Vec<TagId>>,
    pub metadata: Option<Vec<ResourceMetadata>>,
}

#[derive(Debug, Clone)]
pub struct SecretUpdateInput {
    pub filter: SecretFilter,
    pub update: SecretUpdate,
}

impl SecretUpdateInput {
    pub fn new(filter: SecretFilter, update: SecretUpdate) -> Self {
        Self { filter, update }
    }
}

fn validate_identity(key: &str, secret_type: SecretType, user_id: Option<&UserId>) -> Result<()> {
    if key.trim().is_empty() {
        return Err(KeyplaneError::bad_request_field("Secret key cannot be empty", "secret_key"));
    }

    match (secret_type, user_id) {
        (SecretType::Personal, None) => Err(KeyplaneError::bad_request_field(
            format!("Personal secret '{}' requires a user", key),
            "user_id",
        )),
        (SecretType::Shared, Some(_)) => Err(KeyplaneError::bad_request_field(
            format!("Shared secret '{}' cannot belong to a user", key),
            "user_id",
        )),
        _ => Ok(()),
    }
}

fn already_exists(keys: &[&str], field: &str) -> KeyplaneError {
    KeyplaneError::bad_request_field(format!("Secret already exists: {}", keys.join(", ")), field)
}

/// Whether a shared secret named `key` exists once every rename in `updates`
/// has been applied
fn shared_after_batch(existing: &[Secret], updates: &[SecretUpdateInput], key: &str) -> bool {
    let renames_shared = |input: &SecretUpdateInput| {
        input.filter.secret_type == SecretType::Shared
            && input.update.new_key.as_deref().is_some_and(|new_key| new_key != input.filter.key)
    };

    let stays = existing.iter().any(|secret| secret.is_shared() && secret.key == key)
        && !updates.iter().any(|input| input.filter.key == key && renames_shared(input));
    let arrives = updates
        .iter()
        .any(|input| renames_shared(input) && input.update.new_key.as_deref() == Some(key));

    stays || arrives
}

fn distinct_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.filter(|key| seen.insert(*key)).map(str::to_string).collect()
}

/// Writes secrets with their versions, references, tags and metadata
#[derive(Clone)]
pub struct SecretStore {
    secrets: SecretRepository,
    versions: SecretVersionRepository,
    references: SecretReferenceRepository,
    tags: TagRepository,
    cipher: Arc<dyn SecretCipher>,
    reminders: Arc<dyn ReminderScheduler>,
    metrics: MetricsRecorder,
}

impl SecretStore {
    pub fn new(pool: DbPool, cipher: Arc<dyn SecretCipher>, reminders: Arc<dyn ReminderScheduler>) -> Self {
        Self {
            secrets: SecretRepository::new(pool.clone()),
            versions: SecretVersionRepository::new(pool.clone()),
            references: SecretReferenceRepository::new(pool.clone()),
            tags: TagRepository::new(pool),
            cipher,
            reminders,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn cipher(&self) -> &Arc<dyn SecretCipher> {
        &self.cipher
    }

    /// Decrypt the value of a stored secret
    pub fn decrypt_value(&self, secret: &Secret) -> Result<String> {
        self.cipher.decrypt_to_string(&secret.encrypted_value)
    }

    /// Decrypt the comment of a stored secret; a missing comment reads as empty
    pub fn decrypt_comment(&self, secret: &Secret) -> Result<String> {
        match &secret.encrypted_comment {
            Some(blob) => self.cipher.decrypt_to_string(blob),
            None => Ok(String::new()),
        }
    }

    /// Create secrets in the folder.
    ///
    /// Fails with `BadRequest` when a key already exists for the same owner,
    /// when a personal secret has no shared counterpart, or when a tag is not
    /// in the project. Nothing is written on failure.
    #[instrument(skip(self, ctx, inputs), fields(folder_id = %ctx.folder_id, secret_count = inputs.len()))]
    pub async fn bulk_insert(&self, ctx: &FolderContext, inputs: Vec<SecretInput>) -> Result<Vec<Secret>> {
        self.bulk_write(ctx, inputs, Vec::new()).await
    }

    /// Apply partial updates to secrets in the folder.
    ///
    /// Each matched secret's version goes up by one and gains a version row.
    /// Renaming a shared secret carries its personal overrides along.
    #[instrument(skip(self, ctx, updates), fields(folder_id = %ctx.folder_id, secret_count = updates.len()))]
    pub async fn bulk_update(
        &self,
        ctx: &FolderContext,
        updates: Vec<SecretUpdateInput>,
    ) -> Result<Vec<Secret>> {
        self.bulk_write(ctx, Vec::new(), updates).await
    }

    /// Inserts followed by updates in one transaction
    pub async fn bulk_write(
        &self,
        ctx: &FolderContext,
        inputs: Vec<SecretInput>,
        updates: Vec<SecretUpdateInput>,
    ) -> Result<Vec<Secret>> {
        if inputs.is_empty() && updates.is_empty() {
            return Ok(Vec::new());
        }

        for input in &inputs {
            validate_identity(&input.key, input.secret_type, input.user_id.as_ref())?;
        }
        for input in &updates {
            if input.update.new_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
                return Err(KeyplaneError::bad_request_field(
                    "Secret key cannot be empty",
                    "new_secret_key",
                ));
            }
        }
        self.require_tags(
            &ctx.project_id,
            inputs
                .iter()
                .flat_map(|input| input.tag_ids.iter())
                .chain(updates.iter().flat_map(|input| input.update.tag_ids.iter().flatten())),
        )
        .await?;

        let (written, reminders) = async {
            let mut tx = self.secrets.begin().await?;
            let mut reminders = Vec::new();

            let inserted = self.insert_phase(&mut tx, ctx, &inputs, &mut reminders).await?;
            let updated = self.update_phase(&mut tx, ctx, &updates, &mut reminders).await?;

            let mut seen = HashSet::new();
            let ids: Vec<SecretId> =
                inserted.into_iter().chain(updated).filter(|id| seen.insert(id.clone())).collect();
            let written = self.secrets.find_by_ids_in_tx(&mut tx, &ids).await?;
            debug!(secret_count = written.len(), "Committing secret write");

            tx.commit()
                .await
                .map_err(|e| KeyplaneError::database(e, "Failed to commit secret write"))?;
            Ok::<_, KeyplaneError>((written, reminders))
        }
        .instrument(crate::db_span!("bulk_write_secrets", folder_id = %ctx.folder_id))
        .await?;

        info!(
            folder_id = %ctx.folder_id,
            inserted = inputs.len(),
            updated = updates.len(),
            "Secrets written"
        );
        if !inputs.is_empty() {
            self.metrics.record_secret_mutation("insert", inputs.len());
        }
        if !updates.is_empty() {
            self.metrics.record_secret_mutation("update", updates.len());
        }

        for (secret_id, reminder) in &reminders {
            self.apply_reminder(secret_id, reminder.as_ref()).await;
        }

        Ok(written)
    }

    async fn insert_phase(
        &self,
        tx: &mut DbTransaction<'_>,
        ctx: &FolderContext,
        inputs: &[SecretInput],
        reminders: &mut Vec<(SecretId, Option<ReminderSettings>)>,
    ) -> Result<Vec<SecretId>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let batch_duplicates: Vec<&str> = inputs
            .iter()
            .filter(|input| !seen.insert((input.key.as_str(), input.secret_type, input.user_id.as_ref())))
            .map(|input| input.key.as_str())
            .collect();
        if !batch_duplicates.is_empty() {
            return Err(already_exists(&batch_duplicates, "secret_key"));
        }

        let keys = distinct_keys(inputs.iter().map(|input| input.key.as_str()));
        let existing =
            self.secrets.find_in_tx(tx, &ctx.folder_id, &SecretQuery::all().with_keys(keys)).await?;

        let collisions: Vec<&str> = inputs
            .iter()
            .filter(|input| {
                let filter = SecretFilter {
                    key: input.key.clone(),
                    secret_type: input.secret_type,
                    user_id: input.user_id.clone(),
                };
                existing.iter().any(|secret| filter.matches(secret))
            })
            .map(|input| input.key.as_str())
            .collect();
        if !collisions.is_empty() {
            return Err(already_exists(&collisions, "secret_key"));
        }

        let orphans: Vec<&str> = inputs
            .iter()
            .filter(|input| input.secret_type == SecretType::Personal)
            .filter(|input| {
                let shared_exists = existing.iter().any(|s| s.key == input.key && s.is_shared());
                let shared_in_batch = inputs
                    .iter()
                    .any(|other| other.key == input.key && other.secret_type == SecretType::Shared);
                !shared_exists && !shared_in_batch
            })
            .map(|input| input.key.as_str())
            .collect();
        if !orphans.is_empty() {
            return Err(KeyplaneError::bad_request_field(
                format!("Personal secret requires existing shared secret: {}", orphans.join(", ")),
                "secret_key",
            ));
        }

        let mut ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            let record = NewSecretRecord {
                key: input.key.clone(),
                secret_type: input.secret_type,
                user_id: input.user_id.clone(),
                encrypted_value: self.cipher.encrypt_str(&input.value)?,
                encrypted_comment: input
                    .comment
                    .as_deref()
                    .map(|comment| self.cipher.encrypt_str(comment))
                    .transpose()?,
                skip_multiline_encoding: input.skip_multiline_encoding,
                reminder: input.reminder.clone(),
            };
            let secret = self.secrets.insert_in_tx(tx, &ctx.folder_id, &record).await?;

            if !input.tag_ids.is_empty() {
                self.secrets.replace_tags_in_tx(tx, &secret.id, &input.tag_ids).await?;
            }
            if !input.metadata.is_empty() {
                self.secrets.replace_metadata_in_tx(tx, &secret.id, &input.metadata).await?;
            }

            let edges = reference_edges(&secret.id, &ctx.environment, &ctx.secret_path, &input.value);
            self.references.replace_in_tx(tx, &secret.id, &edges).await?;

            if input.reminder.is_scheduled() {
                reminders.push((secret.id.clone(), Some(input.reminder.clone())));
            }
            ids.push(secret.id);
        }

        self.snapshot_in_tx(tx, &ids).await?;
        Ok(ids)
    }

    async fn update_phase(
        &self,
        tx: &mut DbTransaction<'_>,
        ctx: &FolderContext,
        updates: &[SecretUpdateInput],
        reminders: &mut Vec<(SecretId, Option<ReminderSettings>)>,
    ) -> Result<Vec<SecretId>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let keys = distinct_keys(updates.iter().flat_map(|input| {
            std::iter::once(input.filter.key.as_str()).chain(input.update.new_key.as_deref())
        }));
        let existing =
            self.secrets.find_in_tx(tx, &ctx.folder_id, &SecretQuery::all().with_keys(keys)).await?;

        let mut targets = Vec::with_capacity(updates.len());
        for input in updates {
            let target = existing
                .iter()
                .find(|secret| input.filter.matches(secret))
                .ok_or_else(|| KeyplaneError::not_found("Secret", input.filter.key.as_str()))?;

            if let Some(new_key) = input.update.new_key.as_deref().filter(|key| *key != target.key) {
                let renamed = SecretFilter {
                    key: new_key.to_string(),
                    secret_type: target.secret_type,
                    user_id: target.user_id.clone(),
                };
                if existing.iter().any(|secret| renamed.matches(secret)) {
                    return Err(already_exists(&[new_key], "new_secret_key"));
                }
                if target.secret_type == SecretType::Personal && !shared_after_batch(&existing, updates, new_key) {
                    return Err(KeyplaneError::bad_request_field(
                        format!("Personal secret requires existing shared secret: {}", new_key),
                        "new_secret_key",
                    ));
                }
            }

            targets.push((target, &input.update));
        }

        let mut ids: Vec<SecretId> = Vec::new();
        for (target, update) in targets {
            let new_key = update.new_key.clone().filter(|key| *key != target.key);
            let changes = SecretChanges {
                key: new_key.clone(),
                encrypted_value: update
                    .value
                    .as_deref()
                    .map(|value| self.cipher.encrypt_str(value))
                    .transpose()?,
                encrypted_comment: update
                    .comment
                    .as_deref()
                    .map(|comment| self.cipher.encrypt_str(comment).map(Some))
                    .transpose()?,
                skip_multiline_encoding: update.skip_multiline_encoding,
                reminder: update.reminder.clone(),
            };
            self.secrets.update_in_tx(tx, &target.id, &changes).await?;

            if let Some(tag_ids) = &update.tag_ids {
                self.secrets.replace_tags_in_tx(tx, &target.id, tag_ids).await?;
            }
            if let Some(metadata) = &update.metadata {
                self.secrets.replace_metadata_in_tx(tx, &target.id, metadata).await?;
            }
            if let Some(value) = &update.value {
                let edges = reference_edges(&target.id, &ctx.environment, &ctx.secret_path, value);
                self.references.replace_in_tx(tx, &target.id, &edges).await?;
            }

            self.snapshot_in_tx(tx, std::slice::from_ref(&target.id)).await?;
            ids.push(target.id.clone());

            if let Some(reminder) = &update.reminder {
                let scheduled = reminder.is_scheduled().then(|| reminder.clone());
                reminders.push((target.id.clone(), scheduled));
            }

            if let (Some(new_key), true) = (new_key, target.is_shared()) {
                let overrides = existing
                    .iter()
                    .filter(|secret| secret.key == target.key && secret.secret_type == SecretType::Personal);
                for personal in overrides {
                    let rename = SecretChanges { key: Some(new_key.clone()), ..Default::default() };
                    self.secrets.update_in_tx(tx, &personal.id, &rename).await?;
                    self.snapshot_in_tx(tx, std::slice::from_ref(&personal.id)).await?;
                    ids.push(personal.id.clone());
                }
            }
        }

        Ok(ids)
    }

    /// Delete secrets in the folder.
    ///
    /// Deleting a shared secret also deletes every personal override of its
    /// key. Returns the deleted rows.
    #[instrument(skip(self, ctx, filters), fields(folder_id = %ctx.folder_id, secret_count = filters.len()))]
    pub async fn bulk_delete(&self, ctx: &FolderContext, filters: Vec<SecretFilter>) -> Result<Vec<Secret>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let deleted = async {
            let mut tx = self.secrets.begin().await?;

            let keys = distinct_keys(filters.iter().map(|filter| filter.key.as_str()));
            let existing =
                self.secrets.find_in_tx(&mut tx, &ctx.folder_id, &SecretQuery::all().with_keys(keys)).await?;

            let mut seen = HashSet::new();
            let mut deleted: Vec<Secret> = Vec::new();
            for filter in &filters {
                let target = existing
                    .iter()
                    .find(|secret| filter.matches(secret))
                    .ok_or_else(|| KeyplaneError::not_found("Secret", filter.key.as_str()))?;

                if seen.insert(target.id.clone()) {
                    deleted.push(target.clone());
                }

                if target.is_shared() {
                    for personal in existing
                        .iter()
                        .filter(|secret| secret.key == target.key && secret.secret_type == SecretType::Personal)
                    {
                        if seen.insert(personal.id.clone()) {
                            deleted.push(personal.clone());
                        }
                    }
                }
            }

            let ids: Vec<SecretId> = deleted.iter().map(|secret| secret.id.clone()).collect();
            debug!(secret_count = ids.len(), "Deleting secrets");
            self.secrets.delete_by_ids_in_tx(&mut tx, &ids).await?;

            tx.commit()
                .await
                .map_err(|e| KeyplaneError::database(e, "Failed to commit secret delete"))?;
            Ok::<_, KeyplaneError>(deleted)
        }
        .instrument(crate::db_span!("bulk_delete_secrets", folder_id = %ctx.folder_id))
        .await?;

        info!(folder_id = %ctx.folder_id, secret_count = deleted.len(), "Secrets deleted");
        self.metrics.record_secret_mutation("delete", deleted.len());

        for secret in deleted.iter().filter(|secret| secret.reminder.is_scheduled()) {
            self.apply_reminder(&secret.id, None).await;
        }

        Ok(deleted)
    }

    pub async fn find_by_folder_id(&self, folder_id: &FolderId, query: &SecretQuery) -> Result<Vec<Secret>> {
        self.secrets.find_by_folder_id(folder_id, query).await
    }

    pub async fn find_by_folder_ids(&self, folder_ids: &[FolderId], query: &SecretQuery) -> Result<Vec<Secret>> {
        self.secrets.find_by_folder_ids(folder_ids, query).await
    }

    pub async fn find_by_secret_keys(
        &self,
        folder_id: &FolderId,
        keys: &[String],
        visibility: SecretVisibility,
    ) -> Result<Vec<Secret>> {
        self.secrets.find_by_secret_keys(folder_id, keys, visibility).await
    }

    pub async fn find_by_ids(&self, ids: &[SecretId]) -> Result<Vec<Secret>> {
        self.secrets.find_by_ids(ids).await
    }

    /// Schedule or cancel a reminder after commit; failures are advisory
    async fn apply_reminder(&self, secret_id: &SecretId, reminder: Option<&ReminderSettings>) {
        match reminder {
            Some(reminder) => {
                run_advisory(
                    "reminder_create",
                    secret_id.as_str(),
                    self.metrics,
                    self.reminders.create_reminder(secret_id, reminder),
                )
                .await;
            }
            None => {
                run_advisory(
                    "reminder_remove",
                    secret_id.as_str(),
                    self.metrics,
                    self.reminders.remove_reminder(secret_id),
                )
                .await;
            }
        }
    }

    /// Reload the given secrets inside the transaction and write one version row each
    async fn snapshot_in_tx(&self, tx: &mut DbTransaction<'_>, ids: &[SecretId]) -> Result<Vec<Secret>> {
        let secrets = self.secrets.find_by_ids_in_tx(tx, ids).await?;
        let versions: Vec<SecretVersion> = secrets.iter().map(SecretVersion::snapshot).collect();
        self.versions.insert_many_in_tx(tx, &versions).await?;
        Ok(secrets)
    }

    async fn require_tags<'a>(
        &self,
        project_id: &ProjectId,
        tag_ids: impl Iterator<Item = &'a TagId>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let ids: Vec<TagId> = tag_ids.filter(|id| seen.insert(*id)).cloned().collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.tags.require_in_project(project_id, &ids).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

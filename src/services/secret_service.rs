//! Secret business logic service
//!
//! Entry point for callers working in terms of project, environment slug and
//! path. Resolves the folder, routes writes through the approval gate or the
//! transactional store, decrypts reads, merges personal overrides and expands
//! references on request.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    config::SecretsConfig,
    domain::{
        encode_multiline, normalize_secret_path, FolderId, ProjectId, ResourceMetadata, Secret,
        SecretId, SecretType, SecretVersion, Tag, UserId,
    },
    errors::{KeyplaneError, Result},
    observability::MetricsRecorder,
    services::{
        collaborators::{
            run_advisory, Actor, ApprovalCommit, ApprovalPolicy, ApprovalRequest, Collaborators,
            CommitPayload, NewApprovalRequest,
        },
        expansion::{DbFolderSecretSource, ReferenceTrace, SecretExpander},
        folder_resolver::FolderHierarchyResolver,
        secret_encryption::SecretCipher,
        secret_store::{FolderContext, SecretFilter, SecretInput, SecretStore, SecretUpdateInput},
    },
    storage::{
        DbPool, EnvironmentRepository, FolderRepository, ReferencingSecret,
        SecretReferenceRepository, SecretRepository, SecretVersionRepository, SecretQuery,
        SecretVisibility,
    },
};

/// Where an operation happens and who performs it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretScope {
    pub project_id: ProjectId,
    pub environment: String,
    pub secret_path: String,
    pub actor: Actor,
}

impl SecretScope {
    pub fn new(
        project_id: ProjectId,
        environment: impl Into<String>,
        secret_path: impl Into<String>,
        actor: Actor,
    ) -> Self {
        Self {
            project_id,
            environment: environment.into(),
            secret_path: normalize_secret_path(&secret_path.into()),
            actor,
        }
    }

    fn visibility(&self) -> SecretVisibility {
        match self.actor.user_id() {
            Some(user_id) => SecretVisibility::SharedAndPersonalOf(user_id.clone()),
            None => SecretVisibility::Shared,
        }
    }
}

/// Decrypted secret as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDto {
    pub id: SecretId,
    pub secret_key: String,
    pub secret_value: String,
    pub secret_comment: String,
    pub secret_path: String,
    pub environment: String,
    pub folder_id: FolderId,
    pub version: i64,
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    pub user_id: Option<UserId>,
    pub tags: Vec<Tag>,
    pub secret_metadata: Vec<ResourceMetadata>,
    pub skip_multiline_encoding: bool,
    pub secret_reminder_repeat_days: Option<i64>,
    pub secret_reminder_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted historical version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVersionDto {
    pub id: String,
    pub secret_id: SecretId,
    pub version: i64,
    pub secret_key: String,
    pub secret_value: String,
    pub secret_comment: String,
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
}

/// Result of a bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkWriteOutcome {
    /// The write was committed
    Applied(Vec<SecretDto>),
    /// An approval policy intercepted the write
    PendingApproval(ApprovalRequest),
}

impl BulkWriteOutcome {
    pub fn applied(self) -> Option<Vec<SecretDto>> {
        match self {
            BulkWriteOutcome::Applied(secrets) => Some(secrets),
            BulkWriteOutcome::PendingApproval(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, BulkWriteOutcome::PendingApproval(_))
    }
}

/// Options for single-secret reads
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub expand: bool,
    pub encode_multiline: bool,
}

/// Options for folder listings
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Include every descendant folder
    pub recursive: bool,
    pub expand: bool,
    pub encode_multiline: bool,
    pub search: Option<String>,
    pub tag_slugs: Vec<String>,
    pub metadata: Vec<ResourceMetadata>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// Replace each shared row with the caller's personal override of the same
/// key in the same folder, if any
pub fn merge_personal_overrides(secrets: Vec<Secret>) -> Vec<Secret> {
    let (personal, shared): (Vec<Secret>, Vec<Secret>) =
        secrets.into_iter().partition(|secret| secret.secret_type == SecretType::Personal);

    let mut overrides: HashMap<(FolderId, String), Secret> = personal
        .into_iter()
        .map(|secret| ((secret.folder_id.clone(), secret.key.clone()), secret))
        .collect();

    shared
        .into_iter()
        .map(|secret| overrides.remove(&(secret.folder_id.clone(), secret.key.clone())).unwrap_or(secret))
        .collect()
}

/// Service for secret operations
#[derive(Clone)]
pub struct SecretService {
    environments: EnvironmentRepository,
    folders: FolderRepository,
    resolver: FolderHierarchyResolver,
    store: SecretStore,
    secrets: SecretRepository,
    versions: SecretVersionRepository,
    references: SecretReferenceRepository,
    cipher: Arc<dyn SecretCipher>,
    collaborators: Collaborators,
    version_retention_limit: u32,
    metrics: MetricsRecorder,
}

impl SecretService {
    /// Create a new secret service
    pub fn new(
        pool: DbPool,
        cipher: Arc<dyn SecretCipher>,
        collaborators: Collaborators,
        config: &SecretsConfig,
    ) -> Self {
        let folders = FolderRepository::new(pool.clone());
        Self {
            environments: EnvironmentRepository::new(pool.clone()),
            resolver: FolderHierarchyResolver::new(folders.clone()),
            folders,
            store: SecretStore::new(pool.clone(), cipher.clone(), collaborators.reminders.clone()),
            secrets: SecretRepository::new(pool.clone()),
            versions: SecretVersionRepository::new(pool.clone()),
            references: SecretReferenceRepository::new(pool),
            cipher,
            collaborators,
            version_retention_limit: config.version_retention_limit,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    pub fn resolver(&self) -> &FolderHierarchyResolver {
        &self.resolver
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Resolve the folder a scope points at, or `NotFound`
    pub async fn folder_context(
        &self,
        project_id: &ProjectId,
        environment: &str,
        secret_path: &str,
    ) -> Result<FolderContext> {
        let env = self.environments.require_by_slug(project_id, environment).await?;
        let secret_path = normalize_secret_path(secret_path);
        let folder_id = self.resolver.resolve_path(&env.id, &secret_path).await?;
        Ok(FolderContext {
            project_id: project_id.clone(),
            environment: env.slug,
            secret_path,
            folder_id,
        })
    }

    /// Expander over this project's stored secrets
    pub fn expander(&self, project_id: &ProjectId) -> SecretExpander {
        let source = DbFolderSecretSource::new(
            project_id.clone(),
            self.folders.clone(),
            self.secrets.clone(),
            self.cipher.clone(),
        );
        SecretExpander::new(Arc::new(source), self.collaborators.permission.clone())
    }

    /// Create secrets, or file an approval request when a policy applies
    #[instrument(skip(self, scope, inputs), fields(environment = %scope.environment, secret_path = %scope.secret_path))]
    pub async fn create_secrets(&self, scope: &SecretScope, inputs: Vec<SecretInput>) -> Result<BulkWriteOutcome> {
        let ctx = self.folder_context(&scope.project_id, &scope.environment, &scope.secret_path).await?;

        if let Some(policy) = self.policy_for(scope).await? {
            let commits = inputs
                .iter()
                .map(|input| {
                    Ok(ApprovalCommit::Create {
                        secret_key: input.key.clone(),
                        payload: CommitPayload {
                            encrypted_value: Some(self.cipher.encrypt_str(&input.value)?),
                            encrypted_comment: input
                                .comment
                                .as_deref()
                                .map(|comment| self.cipher.encrypt_str(comment))
                                .transpose()?,
                            skip_multiline_encoding: Some(input.skip_multiline_encoding),
                            reminder: Some(input.reminder.clone()),
                            tag_ids: Some(input.tag_ids.clone()),
                            metadata: Some(input.metadata.clone()),
                        },
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            return self.request_approval(scope, &ctx, policy, commits).await;
        }

        let written = self.store.bulk_insert(&ctx, inputs).await?;
        self.after_direct_write(&ctx).await;
        Ok(BulkWriteOutcome::Applied(self.to_dtos(&ctx, written)?))
    }

    /// Update secrets, or file an approval request when a policy applies
    #[instrument(skip(self, scope, updates), fields(environment = %scope.environment, secret_path = %scope.secret_path))]
    pub async fn update_secrets(
        &self,
        scope: &SecretScope,
        updates: Vec<SecretUpdateInput>,
    ) -> Result<BulkWriteOutcome> {
        let ctx = self.folder_context(&scope.project_id, &scope.environment, &scope.secret_path).await?;

        if let Some(policy) = self.policy_for(scope).await? {
            let filters: Vec<SecretFilter> = updates.iter().map(|input| input.filter.clone()).collect();
            let targets = self.match_filters(&ctx, &filters).await?;
            let commits = updates
                .iter()
                .zip(targets)
                .map(|(input, target)| {
                    let update = &input.update;
                    Ok(ApprovalCommit::Update {
                        secret_id: target.id,
                        secret_key: target.key,
                        new_secret_key: update.new_key.clone(),
                        payload: CommitPayload {
                            encrypted_value: update
                                .value
                                .as_deref()
                                .map(|value| self.cipher.encrypt_str(value))
                                .transpose()?,
                            encrypted_comment: update
                                .comment
                                .as_deref()
                                .map(|comment| self.cipher.encrypt_str(comment))
                                .transpose()?,
                            skip_multiline_encoding: update.skip_multiline_encoding,
                            reminder: update.reminder.clone(),
                            tag_ids: update.tag_ids.clone(),
                            metadata: update.metadata.clone(),
                        },
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            return self.request_approval(scope, &ctx, policy, commits).await;
        }

        let written = self.store.bulk_update(&ctx, updates).await?;
        self.after_direct_write(&ctx).await;
        Ok(BulkWriteOutcome::Applied(self.to_dtos(&ctx, written)?))
    }

    /// Delete secrets, or file an approval request when a policy applies
    #[instrument(skip(self, scope, filters), fields(environment = %scope.environment, secret_path = %scope.secret_path))]
    pub async fn delete_secrets(
        &self,
        scope: &SecretScope,
        filters: Vec<SecretFilter>,
    ) -> Result<BulkWriteOutcome> {
        let ctx = self.folder_context(&scope.project_id, &scope.environment, &scope.secret_path).await?;

        if let Some(policy) = self.policy_for(scope).await? {
            let commits = self
                .match_filters(&ctx, &filters)
                .await?
                .into_iter()
                .map(|target| ApprovalCommit::Delete { secret_id: target.id, secret_key: target.key })
                .collect();
            return self.request_approval(scope, &ctx, policy, commits).await;
        }

        let deleted = self.store.bulk_delete(&ctx, filters).await?;
        self.after_direct_write(&ctx).await;
        Ok(BulkWriteOutcome::Applied(self.to_dtos(&ctx, deleted)?))
    }

    /// Read one secret by key; the actor's personal override wins over the
    /// shared value
    #[instrument(skip(self, scope, options), fields(environment = %scope.environment, secret_path = %scope.secret_path))]
    pub async fn get_secret(&self, scope: &SecretScope, secret_key: &str, options: ReadOptions) -> Result<SecretDto> {
        let ctx = self.folder_context(&scope.project_id, &scope.environment, &scope.secret_path).await?;
        let secret = self.find_visible(&ctx, scope, secret_key).await?;

        let mut dto = self.to_dto(&ctx.environment, &ctx.secret_path, secret)?;
        if options.expand {
            let expander = self.expander(&scope.project_id);
            dto.secret_value = expander
                .expand(&dto.secret_value, &dto.environment, &dto.secret_path, &dto.secret_key)
                .await?;
        }
        if options.encode_multiline && !dto.skip_multiline_encoding {
            dto.secret_value = encode_multiline(&dto.secret_value);
        }
        Ok(dto)
    }

    /// List secrets in a folder, optionally including every descendant folder
    #[instrument(skip(self, scope, options), fields(environment = %scope.environment, secret_path = %scope.secret_path, recursive = options.recursive))]
    pub async fn list_secrets(&self, scope: &SecretScope, options: &ListOptions) -> Result<Vec<SecretDto>> {
        let env = self.environments.require_by_slug(&scope.project_id, &scope.environment).await?;
        let secret_path = normalize_secret_path(&scope.secret_path);

        let folder_paths: HashMap<FolderId, String> = if options.recursive {
            let paths = self.resolver.list_paths_under(&env.id, &secret_path).await?;
            if paths.is_empty() {
                return Err(KeyplaneError::not_found("Folder", secret_path.as_str()));
            }
            paths.into_iter().map(|entry| (entry.folder_id, entry.path)).collect()
        } else {
            let folder_id = self.resolver.resolve_path(&env.id, &secret_path).await?;
            HashMap::from([(folder_id, secret_path.clone())])
        };

        let folder_ids: Vec<FolderId> = folder_paths.keys().cloned().collect();
        let query = SecretQuery {
            search: options.search.clone(),
            keys: None,
            tag_slugs: options.tag_slugs.clone(),
            metadata: options.metadata.clone(),
            visibility: scope.visibility(),
            offset: options.offset,
            limit: options.limit,
        };
        let secrets = merge_personal_overrides(self.secrets.find_by_folder_ids(&folder_ids, &query).await?);

        let expander = options.expand.then(|| self.expander(&scope.project_id));
        let mut dtos = Vec::with_capacity(secrets.len());
        for secret in secrets {
            let path = folder_paths
                .get(&secret.folder_id)
                .cloned()
                .unwrap_or_else(|| secret_path.clone());
            let mut dto = self.to_dto(&env.slug, &path, secret)?;
            if let Some(expander) = &expander {
                dto.secret_value = expander
                    .expand(&dto.secret_value, &dto.environment, &dto.secret_path, &dto.secret_key)
                    .await?;
            }
            if options.encode_multiline && !dto.skip_multiline_encoding {
                dto.secret_value = encode_multiline(&dto.secret_value);
            }
            dtos.push(dto);
        }

        dtos.sort_by(|a, b| a.secret_path.cmp(&b.secret_path).then_with(|| a.secret_key.cmp(&b.secret_key)));
        Ok(dtos)
    }

    /// Version history of the secret visible at `secret_key`, newest first
    pub async fn get_secret_versions(
        &self,
        scope: &SecretScope,
        secret_key: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SecretVersionDto>> {
        let ctx = self.folder_context(&scope.project_id, &scope.environment, &scope.secret_path).await?;
        let secret = self.find_visible(&ctx, scope, secret_key).await?;

        self.versions
            .find_by_secret_id(&secret.id, offset, limit)
            .await?
            .into_iter()
            .map(|version| self.to_version_dto(version))
            .collect()
    }

    /// Expand a secret and return the tree of references that were followed
    pub async fn get_reference_tree(&self, scope: &SecretScope, secret_key: &str) -> Result<ReferenceTrace> {
        let ctx = self.folder_context(&scope.project_id, &scope.environment, &scope.secret_path).await?;
        let secret = self.find_visible(&ctx, scope, secret_key).await?;
        let value = self.cipher.decrypt_to_string(&secret.encrypted_value)?;

        self.expander(&scope.project_id)
            .expand_with_trace(&value, &ctx.environment, &ctx.secret_path, &secret.key)
            .await
    }

    /// Secrets whose values reference the secret at `secret_key` in the scope
    pub async fn find_dependents(&self, scope: &SecretScope, secret_key: &str) -> Result<Vec<ReferencingSecret>> {
        self.references
            .find_referencing(
                &scope.project_id,
                &scope.environment,
                &normalize_secret_path(&scope.secret_path),
                secret_key,
            )
            .await
    }

    /// Drop versions beyond the configured retention limit
    pub async fn prune_versions(&self, project_id: &ProjectId) -> Result<u64> {
        let pruned = self.versions.prune_excess_versions(project_id, self.version_retention_limit).await?;
        info!(project_id = %project_id, pruned = pruned, "Pruned secret versions");
        Ok(pruned)
    }

    async fn policy_for(&self, scope: &SecretScope) -> Result<Option<ApprovalPolicy>> {
        if !scope.actor.is_user() {
            return Ok(None);
        }
        self.collaborators
            .approval_gate
            .find_policy(&scope.project_id, &scope.environment, &scope.secret_path)
            .await
    }

    async fn request_approval(
        &self,
        scope: &SecretScope,
        ctx: &FolderContext,
        policy: ApprovalPolicy,
        commits: Vec<ApprovalCommit>,
    ) -> Result<BulkWriteOutcome> {
        let request = self
            .collaborators
            .approval_gate
            .create_request(NewApprovalRequest {
                project_id: scope.project_id.clone(),
                policy,
                folder_id: ctx.folder_id.clone(),
                environment: ctx.environment.clone(),
                secret_path: ctx.secret_path.clone(),
                requested_by: scope.actor.clone(),
                commits,
            })
            .await?;

        info!(
            approval_request_id = %request.id,
            commit_count = request.commit_count,
            "Secret change routed to approval"
        );
        Ok(BulkWriteOutcome::PendingApproval(request))
    }

    /// Folder version bump, snapshot and sync after a committed write
    pub(crate) async fn after_direct_write(&self, ctx: &FolderContext) {
        run_advisory("folder_touch", ctx.folder_id.as_str(), self.metrics, self.folders.touch(&ctx.folder_id))
            .await;
        run_advisory(
            "snapshot",
            ctx.folder_id.as_str(),
            self.metrics,
            self.collaborators.side_effects.snapshot_folder(&ctx.folder_id),
        )
        .await;
        run_advisory(
            "sync",
            ctx.folder_id.as_str(),
            self.metrics,
            self.collaborators.side_effects.sync_secrets(&ctx.project_id, &ctx.environment, &ctx.secret_path),
        )
        .await;
    }

    async fn match_filters(&self, ctx: &FolderContext, filters: &[SecretFilter]) -> Result<Vec<Secret>> {
        let keys: Vec<String> = filters.iter().map(|filter| filter.key.clone()).collect();
        let existing = self.store.find_by_secret_keys(&ctx.folder_id, &keys, SecretVisibility::All).await?;

        filters
            .iter()
            .map(|filter| {
                existing
                    .iter()
                    .find(|secret| filter.matches(secret))
                    .cloned()
                    .ok_or_else(|| KeyplaneError::not_found("Secret", filter.key.as_str()))
            })
            .collect()
    }

    async fn find_visible(&self, ctx: &FolderContext, scope: &SecretScope, secret_key: &str) -> Result<Secret> {
        let found = self
            .store
            .find_by_secret_keys(&ctx.folder_id, &[secret_key.to_string()], scope.visibility())
            .await?;

        merge_personal_overrides(found)
            .into_iter()
            .next()
            .ok_or_else(|| KeyplaneError::not_found("Secret", secret_key))
    }

    fn to_dtos(&self, ctx: &FolderContext, secrets: Vec<Secret>) -> Result<Vec<SecretDto>> {
        secrets
            .into_iter()
            .map(|secret| self.to_dto(&ctx.environment, &ctx.secret_path, secret))
            .collect()
    }

    fn to_dto(&self, environment: &str, secret_path: &str, secret: Secret) -> Result<SecretDto> {
        let secret_value = self.store.decrypt_value(&secret)?;
        let secret_comment = self.store.decrypt_comment(&secret)?;
        Ok(SecretDto {
            id: secret.id,
            secret_key: secret.key,
            secret_value,
            secret_comment,
            secret_path: secret_path.to_string(),
            environment: environment.to_string(),
            folder_id: secret.folder_id,
            version: secret.version,
            secret_type: secret.secret_type,
            user_id: secret.user_id,
            tags: secret.tags,
            secret_metadata: secret.metadata,
            skip_multiline_encoding: secret.skip_multiline_encoding,
            secret_reminder_repeat_days: secret.reminder.repeat_days,
            secret_reminder_note: secret.reminder.note,
            created_at: secret.created_at,
            updated_at: secret.updated_at,
        })
    }

    fn to_version_dto(&self, version: SecretVersion) -> Result<SecretVersionDto> {
        let secret_value = self.cipher.decrypt_to_string(&version.encrypted_value)?;
        let secret_comment = match &version.encrypted_comment {
            Some(blob) => self.cipher.decrypt_to_string(blob)?,
            None => String::new(),
        };
        Ok(SecretVersionDto {
            id: version.id.into_string(),
            secret_id: version.secret_id,
            version: version.version,
            secret_key: version.key,
            secret_value,
            secret_comment,
            secret_type: version.secret_type,
            tags: version.tags,
            created_at: version.created_at,
        })
    }
}

impl std::fmt::Debug for SecretService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReminderSettings;

    fn secret(folder: &FolderId, key: &str, secret_type: SecretType, user: Option<&str>) -> Secret {
        Secret {
            id: SecretId::new(),
            folder_id: folder.clone(),
            key: key.to_string(),
            secret_type,
            user_id: user.map(UserId::from_str_unchecked),
            encrypted_value: Vec::new(),
            encrypted_comment: None,
            version: 1,
            skip_multiline_encoding: false,
            reminder: ReminderSettings::default(),
            tags: Vec::new(),
            metadata: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn personal_override_replaces_shared_in_same_folder() {
        let folder = FolderId::new();
        let other = FolderId::new();
        let shared_db = secret(&folder, "DB", SecretType::Shared, None);
        let personal_db = secret(&folder, "DB", SecretType::Personal, Some("u1"));
        let shared_api = secret(&folder, "API", SecretType::Shared, None);
        let shared_db_other = secret(&other, "DB", SecretType::Shared, None);

        let merged = merge_personal_overrides(vec![
            shared_db.clone(),
            personal_db.clone(),
            shared_api.clone(),
            shared_db_other.clone(),
        ]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, personal_db.id);
        assert_eq!(merged[1].id, shared_api.id);
        assert_eq!(merged[2].id, shared_db_other.id);
    }

    #[test]
    fn scope_normalizes_path_and_visibility() {
        let user = UserId::from_str_unchecked("u1");
        let scope = SecretScope::new(ProjectId::new(), "dev", "app/api/", Actor::User(user.clone()));
        assert_eq!(scope.secret_path, "/app/api");
        assert_eq!(scope.visibility(), SecretVisibility::SharedAndPersonalOf(user));

        let service = SecretScope::new(ProjectId::new(), "dev", "/", Actor::Service("sync".into()));
        assert_eq!(service.visibility(), SecretVisibility::Shared);
    }

    #[test]
    fn outcome_helpers() {
        let applied = BulkWriteOutcome::Applied(Vec::new());
        assert!(!applied.is_pending());
        assert_eq!(applied.applied(), Some(Vec::new()));
    }
}

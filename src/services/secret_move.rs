//! Secret move orchestration
//!
//! Moves shared secrets between folders, possibly across environments. The
//! destination side is written first (creates and overwrites), then the
//! source side is deleted. Either side goes through an approval request
//! instead when a policy covers it and the actor is a user.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn, Instrument};

use crate::{
    domain::{normalize_secret_path, ProjectId, Secret, SecretId},
    errors::{KeyplaneError, Result},
    observability::MetricsRecorder,
    services::{
        collaborators::{
            Actor, ApprovalCommit, ApprovalPolicy, ApprovalRequest, CommitPayload, NewApprovalRequest,
        },
        secret_service::SecretService,
        secret_store::{FolderContext, SecretFilter, SecretInput, SecretUpdate, SecretUpdateInput},
    },
    storage::SecretVisibility,
};

/// Input to [`MoveOrchestrator::move_secrets`]
#[derive(Debug, Clone)]
pub struct MoveSecretsRequest {
    pub project_id: ProjectId,
    pub source_environment: String,
    pub source_secret_path: String,
    pub destination_environment: String,
    pub destination_secret_path: String,
    pub secret_ids: Vec<SecretId>,
    /// Replace destination secrets that already exist under the same key
    pub should_overwrite: bool,
    pub actor: Actor,
}

/// What a move changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveSecretsOutcome {
    pub project_id: ProjectId,
    pub is_source_updated: bool,
    pub is_destination_updated: bool,
    pub approval_requests: Vec<ApprovalRequest>,
    /// Set when the destination side was applied or filed for approval but
    /// the source side then failed; the secrets remain in the source folder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
}

/// One source secret decrypted for the move
#[derive(Debug)]
struct MovedSecret {
    source: Secret,
    value: String,
    comment: Option<String>,
}

impl MovedSecret {
    fn payload(&self) -> CommitPayload {
        CommitPayload {
            encrypted_value: Some(self.source.encrypted_value.clone()),
            encrypted_comment: self.source.encrypted_comment.clone(),
            skip_multiline_encoding: Some(self.source.skip_multiline_encoding),
            reminder: Some(self.source.reminder.clone()),
            tag_ids: Some(self.source.tags.iter().map(|tag| tag.id.clone()).collect()),
            metadata: Some(self.source.metadata.clone()),
        }
    }
}

/// Moves secrets between folders
#[derive(Debug, Clone)]
pub struct MoveOrchestrator {
    service: SecretService,
    metrics: MetricsRecorder,
}

impl MoveOrchestrator {
    pub fn new(service: SecretService) -> Self {
        Self { service, metrics: MetricsRecorder::new() }
    }

    /// Move `secret_ids` from the source folder to the destination folder.
    ///
    /// Fails with `NotFound` if a folder or any of the secrets is missing from
    /// the source, and with `BadRequest` listing the colliding keys when the
    /// destination already holds some of them and `should_overwrite` is off.
    /// Destination secrets whose value already matches are left untouched.
    ///
    /// Both approval policies are resolved before anything is written. If the
    /// source side fails after the destination side was applied or filed for
    /// approval, the outcome is still returned with `source_error` set.
    #[instrument(skip(self, request), fields(
        project_id = %request.project_id,
        source = %request.source_environment,
        destination = %request.destination_environment,
        secret_count = request.secret_ids.len()
    ))]
    pub async fn move_secrets(&self, request: MoveSecretsRequest) -> Result<MoveSecretsOutcome> {
        let source_ctx = self
            .service
            .folder_context(&request.project_id, &request.source_environment, &request.source_secret_path)
            .await?;
        let destination_ctx = self
            .service
            .folder_context(
                &request.project_id,
                &request.destination_environment,
                &request.destination_secret_path,
            )
            .await?;

        if source_ctx.folder_id == destination_ctx.folder_id {
            return Err(KeyplaneError::bad_request(
                "Source and destination are the same folder",
            ));
        }

        let moved = self.load_source_secrets(&source_ctx, &request.secret_ids).await?;
        let mut outcome = MoveSecretsOutcome {
            project_id: request.project_id.clone(),
            is_source_updated: false,
            is_destination_updated: false,
            approval_requests: Vec::new(),
            source_error: None,
        };
        if moved.is_empty() {
            return Ok(outcome);
        }

        let keys: Vec<String> = moved.iter().map(|secret| secret.source.key.clone()).collect();
        let existing = self
            .service
            .store()
            .find_by_secret_keys(&destination_ctx.folder_id, &keys, SecretVisibility::Shared)
            .await?;

        let mut to_create = Vec::new();
        let mut to_update = Vec::new();
        for secret in &moved {
            match existing.iter().find(|dest| dest.key == secret.source.key) {
                None => to_create.push(secret),
                Some(dest) => {
                    let current = self.service.store().decrypt_value(dest)?;
                    if current != secret.value {
                        to_update.push((secret, dest));
                    }
                }
            }
        }

        if !to_update.is_empty() && !request.should_overwrite {
            let colliding: Vec<&str> = to_update.iter().map(|(secret, _)| secret.source.key.as_str()).collect();
            return Err(KeyplaneError::bad_request_field(
                format!(
                    "The following secrets already exist in the destination: {}",
                    colliding.join(", ")
                ),
                "should_overwrite",
            ));
        }

        let has_destination_changes = !to_create.is_empty() || !to_update.is_empty();
        let destination_policy = if has_destination_changes {
            self.policy_for(&request.actor, &destination_ctx).await?
        } else {
            None
        };
        let source_policy = self.policy_for(&request.actor, &source_ctx).await?;

        if has_destination_changes {
            match destination_policy {
                Some(policy) => {
                    let commits = to_create
                        .iter()
                        .map(|secret| ApprovalCommit::Create {
                            secret_key: secret.source.key.clone(),
                            payload: secret.payload(),
                        })
                        .chain(to_update.iter().map(|(secret, dest)| ApprovalCommit::Update {
                            secret_id: dest.id.clone(),
                            secret_key: dest.key.clone(),
                            new_secret_key: None,
                            payload: secret.payload(),
                        }))
                        .collect();
                    let approval = self.request_approval(&request, &destination_ctx, policy, commits).await?;
                    outcome.approval_requests.push(approval);
                }
                None => {
                    let inputs = to_create.iter().copied().map(to_input).collect();
                    let updates = to_update
                        .iter()
                        .map(|(secret, dest)| {
                            SecretUpdateInput::new(
                                SecretFilter::shared(dest.key.clone()),
                                SecretUpdate {
                                    value: Some(secret.value.clone()),
                                    comment: secret.comment.clone(),
                                    skip_multiline_encoding: Some(secret.source.skip_multiline_encoding),
                                    reminder: Some(secret.source.reminder.clone()),
                                    tag_ids: Some(secret.source.tags.iter().map(|tag| tag.id.clone()).collect()),
                                    metadata: Some(secret.source.metadata.clone()),
                                    ..Default::default()
                                },
                            )
                        })
                        .collect();
                    self.service
                        .store()
                        .bulk_write(&destination_ctx, inputs, updates)
                        .instrument(crate::secret_span!(
                            "move_destination",
                            destination_ctx.environment,
                            destination_ctx.secret_path
                        ))
                        .await?;
                    outcome.is_destination_updated = true;
                    self.service.after_direct_write(&destination_ctx).await;
                }
            }
        }

        let source_result = match source_policy {
            Some(policy) => {
                let commits = moved
                    .iter()
                    .map(|secret| ApprovalCommit::Delete {
                        secret_id: secret.source.id.clone(),
                        secret_key: secret.source.key.clone(),
                    })
                    .collect();
                self.request_approval(&request, &source_ctx, policy, commits)
                    .await
                    .map(|approval| outcome.approval_requests.push(approval))
            }
            None => {
                let filters = moved.iter().map(|secret| SecretFilter::shared(secret.source.key.clone())).collect();
                self.service
                    .store()
                    .bulk_delete(&source_ctx, filters)
                    .instrument(crate::secret_span!("move_source", source_ctx.environment, source_ctx.secret_path))
                    .await
                    .map(|_| outcome.is_source_updated = true)
            }
        };

        match source_result {
            Ok(()) if outcome.is_source_updated => self.service.after_direct_write(&source_ctx).await,
            Ok(()) => {}
            // Nothing has been applied yet, so the move failed as a whole
            Err(e) if !has_destination_changes => return Err(e),
            Err(e) => {
                warn!(
                    error = %e,
                    is_destination_updated = outcome.is_destination_updated,
                    "Source side of move failed after the destination was handled"
                );
                outcome.source_error = Some(e.to_string());
            }
        }

        self.metrics.record_secret_mutation("move", moved.len());
        info!(
            moved = moved.len(),
            created = to_create.len(),
            overwritten = to_update.len(),
            approvals = outcome.approval_requests.len(),
            "Secrets moved"
        );

        Ok(outcome)
    }

    async fn load_source_secrets(&self, ctx: &FolderContext, ids: &[SecretId]) -> Result<Vec<MovedSecret>> {
        let mut seen = HashSet::new();
        let ids: Vec<SecretId> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();

        let found = self.service.store().find_by_ids(&ids).await?;
        let missing: Vec<&str> = ids
            .iter()
            .filter(|id| {
                !found
                    .iter()
                    .any(|secret| &secret.id == *id && secret.folder_id == ctx.folder_id && secret.is_shared())
            })
            .map(|id| id.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(KeyplaneError::not_found("Secret", missing.join(", ")));
        }

        found
            .into_iter()
            .map(|source| {
                let value = self.service.store().decrypt_value(&source)?;
                let comment = match &source.encrypted_comment {
                    Some(_) => Some(self.service.store().decrypt_comment(&source)?),
                    None => None,
                };
                Ok(MovedSecret { source, value, comment })
            })
            .collect()
    }

    async fn policy_for(
        &self,
        actor: &Actor,
        ctx: &FolderContext,
    ) -> Result<Option<ApprovalPolicy>> {
        if !actor.is_user() {
            return Ok(None);
        }
        self.service
            .collaborators()
            .approval_gate
            .find_policy(&ctx.project_id, &ctx.environment, &normalize_secret_path(&ctx.secret_path))
            .await
    }

    async fn request_approval(
        &self,
        request: &MoveSecretsRequest,
        ctx: &FolderContext,
        policy: ApprovalPolicy,
        commits: Vec<ApprovalCommit>,
    ) -> Result<ApprovalRequest> {
        self.service
            .collaborators()
            .approval_gate
            .create_request(NewApprovalRequest {
                project_id: request.project_id.clone(),
                policy,
                folder_id: ctx.folder_id.clone(),
                environment: ctx.environment.clone(),
                secret_path: ctx.secret_path.clone(),
                requested_by: request.actor.clone(),
                commits,
            })
            .await
    }
}

fn to_input(secret: &MovedSecret) -> SecretInput {
    SecretInput {
        key: secret.source.key.clone(),
        secret_type: secret.source.secret_type,
        user_id: None,
        value: secret.value.clone(),
        comment: secret.comment.clone(),
        skip_multiline_encoding: secret.source.skip_multiline_encoding,
        reminder: secret.source.reminder.clone(),
        tag_ids: secret.source.tags.iter().map(|tag| tag.id.clone()).collect(),
        metadata: secret.source.metadata.clone(),
    }
}

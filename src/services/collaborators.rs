//! Collaborator contracts
//!
//! Capabilities the secret core consumes but does not implement: permission
//! checks during expansion, approval policies, post-write side effects and
//! reminder scheduling. Each comes with a permissive no-op implementation so
//! the core is usable standalone.

use crate::domain::{
    ApprovalRequestId, FolderId, ProjectId, ReminderSettings, ResourceMetadata, SecretId, TagId,
    UserId,
};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Who is performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A human user; subject to approval policies
    User(UserId),
    /// A machine identity
    Identity(String),
    /// An internal service
    Service(String),
}

impl Actor {
    pub fn is_user(&self) -> bool {
        matches!(self, Actor::User(_))
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Actor::User(id) => Some(id),
            _ => None,
        }
    }
}

/// Decides whether a referenced secret may be read during expansion
#[async_trait]
pub trait ExpansionPermission: Send + Sync {
    async fn can_expand_value(
        &self,
        environment: &str,
        secret_path: &str,
        secret_key: &str,
        tag_slugs: &[String],
    ) -> bool;
}

/// Permission predicate that allows every reference
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllExpansion;

#[async_trait]
impl ExpansionPermission for AllowAllExpansion {
    async fn can_expand_value(&self, _: &str, _: &str, _: &str, _: &[String]) -> bool {
        true
    }
}

/// An active approval policy on a folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: String,
    pub name: String,
    pub approvals_required: u32,
}

/// Field values carried by a pending create or update. Values are ciphertext.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPayload {
    pub encrypted_value: Option<Vec<u8>>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub skip_multiline_encoding: Option<bool>,
    pub reminder: Option<ReminderSettings>,
    pub tag_ids: Option<Vec<TagId>>,
    pub metadata: Option<Vec<ResourceMetadata>>,
}

/// One pending change inside an approval request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalCommit {
    Create {
        secret_key: String,
        payload: CommitPayload,
    },
    Update {
        secret_id: SecretId,
        secret_key: String,
        new_secret_key: Option<String>,
        payload: CommitPayload,
    },
    Delete {
        secret_id: SecretId,
        secret_key: String,
    },
}

impl ApprovalCommit {
    pub fn secret_key(&self) -> &str {
        match self {
            ApprovalCommit::Create { secret_key, .. }
            | ApprovalCommit::Update { secret_key, .. }
            | ApprovalCommit::Delete { secret_key, .. } => secret_key,
        }
    }
}

/// Request handed to [`ApprovalGate::create_request`]
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub project_id: ProjectId,
    pub policy: ApprovalPolicy,
    pub folder_id: FolderId,
    pub environment: String,
    pub secret_path: String,
    pub requested_by: Actor,
    pub commits: Vec<ApprovalCommit>,
}

/// A created approval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalRequestId,
    pub policy_id: String,
    pub folder_id: FolderId,
    pub commit_count: usize,
}

/// Approval policy lookup and request creation
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn find_policy(
        &self,
        project_id: &ProjectId,
        environment: &str,
        secret_path: &str,
    ) -> Result<Option<ApprovalPolicy>>;

    async fn create_request(&self, request: NewApprovalRequest) -> Result<ApprovalRequest>;
}

/// Gate with no policies configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoApprovalPolicies;

#[async_trait]
impl ApprovalGate for NoApprovalPolicies {
    async fn find_policy(&self, _: &ProjectId, _: &str, _: &str) -> Result<Option<ApprovalPolicy>> {
        Ok(None)
    }

    async fn create_request(&self, request: NewApprovalRequest) -> Result<ApprovalRequest> {
        Ok(ApprovalRequest {
            id: ApprovalRequestId::new(),
            policy_id: request.policy.id,
            folder_id: request.folder_id,
            commit_count: request.commits.len(),
        })
    }
}

/// Fire-and-forget triggers after a direct write
#[async_trait]
pub trait SecretSideEffects: Send + Sync {
    async fn snapshot_folder(&self, folder_id: &FolderId) -> Result<()>;

    async fn sync_secrets(
        &self,
        project_id: &ProjectId,
        environment: &str,
        secret_path: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSideEffects;

#[async_trait]
impl SecretSideEffects for NoopSideEffects {
    async fn snapshot_folder(&self, _: &FolderId) -> Result<()> {
        Ok(())
    }

    async fn sync_secrets(&self, _: &ProjectId, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Scheduler for rotation reminders
#[async_trait]
pub trait ReminderScheduler: Send + Sync {
    async fn create_reminder(&self, secret_id: &SecretId, reminder: &ReminderSettings) -> Result<()>;

    async fn remove_reminder(&self, secret_id: &SecretId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReminderScheduler;

#[async_trait]
impl ReminderScheduler for NoopReminderScheduler {
    async fn create_reminder(&self, _: &SecretId, _: &ReminderSettings) -> Result<()> {
        Ok(())
    }

    async fn remove_reminder(&self, _: &SecretId) -> Result<()> {
        Ok(())
    }
}

/// Bundle of injected collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub permission: Arc<dyn ExpansionPermission>,
    pub approval_gate: Arc<dyn ApprovalGate>,
    pub side_effects: Arc<dyn SecretSideEffects>,
    pub reminders: Arc<dyn ReminderScheduler>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            permission: Arc::new(AllowAllExpansion),
            approval_gate: Arc::new(NoApprovalPolicies),
            side_effects: Arc::new(NoopSideEffects),
            reminders: Arc::new(NoopReminderScheduler),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Await an advisory side effect. Failures are logged and counted, never returned.
pub(crate) async fn run_advisory<F>(kind: &'static str, subject: &str, metrics: MetricsRecorder, effect: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    match effect.await {
        Ok(()) => true,
        Err(e) => {
            warn!(kind = kind, subject = %subject, error = %e, "Advisory side effect failed");
            metrics.record_side_effect_failure(kind);
            false
        }
    }
}

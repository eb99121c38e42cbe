//! Seeded project with `dev` and `prod` environments and a wired service.

use super::test_db::TestDatabase;
use async_trait::async_trait;
use keyplane::config::SecretsConfig;
use keyplane::domain::{FolderId, ProjectId, ReminderSettings, SecretId, UserId};
use keyplane::errors::{KeyplaneError, Result};
use keyplane::services::{
    Actor, AesGcmCipher, ApprovalGate, ApprovalPolicy, ApprovalRequest, Collaborators,
    FolderContext, MoveOrchestrator, NewApprovalRequest, ReminderScheduler, SecretCipher,
    SecretScope, SecretService, SecretSideEffects,
};
use keyplane::storage::{EnvironmentData, EnvironmentRepository, FolderRepository, TagRepository};
use std::sync::{Arc, Mutex};

pub struct Fixture {
    pub db: TestDatabase,
    pub project_id: ProjectId,
    pub dev: EnvironmentData,
    pub prod: EnvironmentData,
    pub service: SecretService,
    pub folders: FolderRepository,
    pub tags: TagRepository,
    pub environments: EnvironmentRepository,
}

pub fn test_cipher() -> Arc<dyn SecretCipher> {
    Arc::new(AesGcmCipher::from_key([0x42u8; 32], "test"))
}

impl Fixture {
    pub async fn new(prefix: &str) -> Self {
        Self::with_collaborators(prefix, Collaborators::default()).await
    }

    pub async fn with_collaborators(prefix: &str, collaborators: Collaborators) -> Self {
        let db = TestDatabase::new(prefix).await;
        let environments = EnvironmentRepository::new(db.pool.clone());
        let project = environments.create_project("acme").await.expect("create project");
        let dev = environments
            .create_environment(&project.id, "Development", "dev")
            .await
            .expect("create dev environment");
        let prod = environments
            .create_environment(&project.id, "Production", "prod")
            .await
            .expect("create prod environment");

        let service = SecretService::new(
            db.pool.clone(),
            test_cipher(),
            collaborators,
            &SecretsConfig { version_retention_limit: 3, ..Default::default() },
        );

        Self {
            folders: FolderRepository::new(db.pool.clone()),
            tags: TagRepository::new(db.pool.clone()),
            environments,
            project_id: project.id,
            dev,
            prod,
            service,
            db,
        }
    }

    pub fn orchestrator(&self) -> MoveOrchestrator {
        MoveOrchestrator::new(self.service.clone())
    }

    pub fn scope(&self, environment: &str, path: &str) -> SecretScope {
        SecretScope::new(self.project_id.clone(), environment, path, Actor::Service("test".into()))
    }

    pub fn user_scope(&self, environment: &str, path: &str, user: &UserId) -> SecretScope {
        SecretScope::new(self.project_id.clone(), environment, path, Actor::User(user.clone()))
    }

    /// Create the folders along `path` in `environment` and return its context
    pub async fn folder(&self, environment: &str, path: &str) -> FolderContext {
        let env = if environment == "dev" { &self.dev } else { &self.prod };
        self.service.resolver().ensure_path(&env.id, path).await.expect("ensure folder path");
        self.service
            .folder_context(&self.project_id, environment, path)
            .await
            .expect("resolve folder context")
    }
}

/// Approval gate that applies a policy to every folder and records requests
#[derive(Default)]
pub struct RecordingGate {
    pub requests: Mutex<Vec<NewApprovalRequest>>,
    /// Only folders under these `(environment, path)` pairs are gated; empty gates all
    pub gated: Vec<(String, String)>,
    /// Policy lookups for these `(environment, path)` pairs fail
    pub failing_lookups: Vec<(String, String)>,
    /// Requests for these `(environment, path)` pairs fail
    pub failing_requests: Vec<(String, String)>,
}

fn listed(pairs: &[(String, String)], environment: &str, secret_path: &str) -> bool {
    pairs.iter().any(|(env, path)| env == environment && path == secret_path)
}

#[async_trait]
impl ApprovalGate for RecordingGate {
    async fn find_policy(
        &self,
        _project_id: &ProjectId,
        environment: &str,
        secret_path: &str,
    ) -> Result<Option<ApprovalPolicy>> {
        if listed(&self.failing_lookups, environment, secret_path) {
            return Err(KeyplaneError::internal("policy engine unavailable"));
        }
        let gated = self.gated.is_empty() || listed(&self.gated, environment, secret_path);
        Ok(gated.then(|| ApprovalPolicy {
            id: "policy-1".into(),
            name: "Two person rule".into(),
            approvals_required: 2,
        }))
    }

    async fn create_request(&self, request: NewApprovalRequest) -> Result<ApprovalRequest> {
        if listed(&self.failing_requests, &request.environment, &request.secret_path) {
            return Err(KeyplaneError::internal("approval store unavailable"));
        }
        let created = ApprovalRequest {
            id: keyplane::domain::ApprovalRequestId::new(),
            policy_id: request.policy.id.clone(),
            folder_id: request.folder_id.clone(),
            commit_count: request.commits.len(),
        };
        self.requests.lock().expect("requests lock").push(request);
        Ok(created)
    }
}

/// Side effects that record every folder snapshot
#[derive(Default)]
pub struct RecordingSideEffects {
    pub snapshots: Mutex<Vec<FolderId>>,
}

#[async_trait]
impl SecretSideEffects for RecordingSideEffects {
    async fn snapshot_folder(&self, folder_id: &FolderId) -> Result<()> {
        self.snapshots.lock().expect("snapshots lock").push(folder_id.clone());
        Ok(())
    }

    async fn sync_secrets(&self, _: &ProjectId, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Reminder scheduler that always fails
pub struct FailingReminders;

#[async_trait]
impl ReminderScheduler for FailingReminders {
    async fn create_reminder(&self, _: &SecretId, _: &ReminderSettings) -> Result<()> {
        Err(KeyplaneError::internal("reminder queue unavailable"))
    }

    async fn remove_reminder(&self, _: &SecretId) -> Result<()> {
        Err(KeyplaneError::internal("reminder queue unavailable"))
    }
}

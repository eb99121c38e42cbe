//! Business logic services
//!
//! This module contains the secret core's service layer: the transactional
//! store, reference expansion, folder resolution and move orchestration,
//! plus the collaborator contracts they consume.

pub mod collaborators;
pub mod expansion;
pub mod folder_resolver;
pub mod secret_encryption;
pub mod secret_move;
pub mod secret_service;
pub mod secret_store;

pub use collaborators::{
    Actor, AllowAllExpansion, ApprovalCommit, ApprovalGate, ApprovalPolicy, ApprovalRequest,
    Collaborators, CommitPayload, ExpansionPermission, NewApprovalRequest, NoApprovalPolicies,
    NoopReminderScheduler, NoopSideEffects, ReminderScheduler, SecretSideEffects,
};
pub use expansion::{
    DbFolderSecretSource, FolderSecretSource, ReferenceTrace, ReferenceTreeNode, ResolvedSecret,
    SecretExpander, MAX_SECRET_REFERENCE_DEPTH,
};
pub use folder_resolver::FolderHierarchyResolver;
pub use secret_encryption::{AesGcmCipher, SecretCipher};
pub use secret_move::{MoveOrchestrator, MoveSecretsOutcome, MoveSecretsRequest};
pub use secret_service::{
    merge_personal_overrides, BulkWriteOutcome, ListOptions, ReadOptions, SecretDto, SecretScope,
    SecretService, SecretVersionDto,
};
pub use secret_store::{
    FolderContext, SecretFilter, SecretInput, SecretStore, SecretUpdate, SecretUpdateInput,
};

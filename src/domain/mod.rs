//! Domain layer
//!
//! Pure domain entities for the secret core, with no storage dependencies
//! beyond the SQLx encode/decode impls on identifiers.
//!
//! ## Module Organization
//!
//! - `id`: Type-safe domain identifiers with NewType pattern
//! - `folder`: Folder tree model and path materialization
//! - `secret`: Secrets, versions, tags, metadata and reference edges
//! - `reference`: Interpolation token extraction

pub mod folder;
pub mod id;
pub mod reference;
pub mod secret;

pub use folder::{
    build_folder_paths, is_path_under, normalize_secret_path, Folder, FolderPath,
    MAX_FOLDER_DEPTH, ROOT_FOLDER_NAME, ROOT_PATH,
};
pub use id::{
    ApprovalRequestId, EnvironmentId, FolderId, ProjectId, SecretId, SecretVersionId, TagId,
    UserId,
};
pub use reference::{
    extract_references, has_references, reference_edges, scan_tokens, ExtractedReferences,
    ReferenceToken, RemoteReference, TokenTarget,
};
pub use secret::{
    encode_multiline, ReminderSettings, ResourceMetadata, Secret, SecretReference, SecretType,
    SecretVersion, Tag,
};

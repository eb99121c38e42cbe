//! Repository modules for data access
//!
//! Each repository handles the rows of one concern. Secret-side write methods
//! take an open transaction so a bulk call commits as one unit.

pub mod environment;
pub mod folder;
pub mod secret;
pub mod secret_reference;
pub mod secret_version;
pub mod tag;

pub use environment::{EnvironmentData, EnvironmentRepository, ProjectData};
pub use folder::FolderRepository;
pub use secret::{
    NewSecretRecord, SecretChanges, SecretQuery, SecretRepository, SecretVisibility,
};
pub use secret_reference::{ReferencingSecret, SecretReferenceRepository};
pub use secret_version::SecretVersionRepository;
pub use tag::TagRepository;

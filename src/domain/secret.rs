//! Secret domain types
//!
//! Secrets live in exactly one folder. A `Shared` secret is the canonical value
//! for a key; a `Personal` secret overrides it for a single user. Values and
//! comments are held as opaque ciphertext blobs; only the cipher capability in
//! the services layer can read them.

use super::id::{FolderId, ProjectId, SecretId, SecretVersionId, TagId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Visibility of a secret record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// Canonical value visible to every authorized user
    Shared,
    /// Per-user override of a shared value
    Personal,
}

impl SecretType {
    /// Get the database representation of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Personal => "personal",
        }
    }
}

impl FromStr for SecretType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "personal" => Ok(Self::Personal),
            _ => Err(format!("Unknown secret type: {}", s)),
        }
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Project scoped label attached to secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub project_id: ProjectId,
    pub slug: String,
    pub color: Option<String>,
}

/// Free-form key/value metadata on a secret
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub key: String,
    pub value: String,
}

impl ResourceMetadata {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Reminder settings carried by a secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSettings {
    pub repeat_days: Option<i64>,
    pub note: Option<String>,
}

impl ReminderSettings {
    pub fn is_scheduled(&self) -> bool {
        self.repeat_days.is_some()
    }
}

/// A stored secret with its tag and metadata annotations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub id: SecretId,
    pub folder_id: FolderId,
    pub key: String,
    pub secret_type: SecretType,
    pub user_id: Option<UserId>,
    pub encrypted_value: Vec<u8>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub version: i64,
    pub skip_multiline_encoding: bool,
    pub reminder: ReminderSettings,
    pub tags: Vec<Tag>,
    pub metadata: Vec<ResourceMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn is_shared(&self) -> bool {
        self.secret_type == SecretType::Shared
    }

    pub fn tag_slugs(&self) -> Vec<String> {
        self.tags.iter().map(|tag| tag.slug.clone()).collect()
    }
}

/// Immutable snapshot appended on every create and update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretVersion {
    pub id: SecretVersionId,
    pub secret_id: SecretId,
    pub folder_id: FolderId,
    pub key: String,
    pub secret_type: SecretType,
    pub user_id: Option<UserId>,
    pub encrypted_value: Vec<u8>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub version: i64,
    pub skip_multiline_encoding: bool,
    pub reminder: ReminderSettings,
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
}

impl SecretVersion {
    /// Snapshot the post-write state of a secret
    pub fn snapshot(secret: &Secret) -> Self {
        Self {
            id: SecretVersionId::new(),
            secret_id: secret.id.clone(),
            folder_id: secret.folder_id.clone(),
            key: secret.key.clone(),
            secret_type: secret.secret_type,
            user_id: secret.user_id.clone(),
            encrypted_value: secret.encrypted_value.clone(),
            encrypted_comment: secret.encrypted_comment.clone(),
            version: secret.version,
            skip_multiline_encoding: secret.skip_multiline_encoding,
            reminder: secret.reminder.clone(),
            tags: secret.tags.clone(),
            created_at: Utc::now(),
        }
    }
}

/// One outgoing reference edge of a secret, addressed logically
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretReference {
    pub secret_id: SecretId,
    pub environment: String,
    pub secret_path: String,
    pub secret_key: String,
}

/// Re-encode a multi-line value as a single double-quoted line with escaped
/// newlines, so it survives `KEY=value` exports. Single-line values pass
/// through untouched.
pub fn encode_multiline(value: &str) -> String {
    if value.contains('\n') {
        format!("\"{}\"", value.replace('\n', "\\n"))
    } else {
        value.to_string()
    }
}

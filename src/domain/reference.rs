//! Reference extraction
//!
//! Secret values may embed `${KEY}` (same folder) or `${env.path.segments.KEY}`
//! (explicit environment and path) tokens. This module only classifies that
//! syntax; it never looks anything up.

use super::folder::ROOT_PATH;
use super::id::SecretId;
use super::secret::SecretReference;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

lazy_static! {
    static ref INTERPOLATION_REGEX: Regex = Regex::new(r"\$\{([a-zA-Z0-9_.\-]+)\}")
        .expect("BUG: INTERPOLATION_REGEX pattern is invalid - validated by tests");
}

/// A reference to a secret in an explicit environment and path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteReference {
    pub environment: String,
    pub secret_path: String,
    pub secret_key: String,
}

/// Result of scanning one value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedReferences {
    /// Keys referenced in the same folder and environment
    pub local: Vec<String>,
    pub remote: Vec<RemoteReference>,
}

impl ExtractedReferences {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }
}

/// Target named by one token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenTarget {
    Local { secret_key: String },
    Remote(RemoteReference),
}

/// One distinct `${...}` token found in a value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceToken {
    /// Full token text including `${` and `}`
    pub raw: String,
    pub target: TokenTarget,
}

impl ReferenceToken {
    /// Resolve to `(environment, secret_path, secret_key)`; local tokens inherit
    /// the given environment and path.
    pub fn resolve(&self, environment: &str, secret_path: &str) -> (String, String, String) {
        match &self.target {
            TokenTarget::Local { secret_key } => {
                (environment.to_string(), secret_path.to_string(), secret_key.clone())
            }
            TokenTarget::Remote(remote) => (
                remote.environment.clone(),
                remote.secret_path.clone(),
                remote.secret_key.clone(),
            ),
        }
    }
}

fn classify(identifier: &str) -> Option<TokenTarget> {
    if !identifier.contains('.') {
        return Some(TokenTarget::Local { secret_key: identifier.to_string() });
    }

    let segments: Vec<&str> = identifier.split('.').collect();
    let environment = segments.first().copied().unwrap_or_default();
    let secret_key = segments.last().copied().unwrap_or_default();
    if environment.is_empty() || secret_key.is_empty() {
        return None;
    }

    let middle: Vec<&str> = segments[1..segments.len() - 1]
        .iter()
        .copied()
        .filter(|segment| !segment.is_empty())
        .collect();
    let secret_path =
        if middle.is_empty() { ROOT_PATH.to_string() } else { format!("/{}", middle.join("/")) };

    Some(TokenTarget::Remote(RemoteReference {
        environment: environment.to_string(),
        secret_path,
        secret_key: secret_key.to_string(),
    }))
}

/// Scan a value for distinct tokens, in order of first appearance.
///
/// Tokens with an empty environment or key segment (`${.KEY}`, `${env.}`) are
/// not references and are left alone.
pub fn scan_tokens(value: &str) -> Vec<ReferenceToken> {
    let mut seen = HashSet::new();
    INTERPOLATION_REGEX
        .captures_iter(value)
        .filter_map(|captures| {
            let raw = captures.get(0)?.as_str();
            let identifier = captures.get(1)?.as_str();
            if !seen.insert(raw.to_string()) {
                return None;
            }
            classify(identifier).map(|target| ReferenceToken { raw: raw.to_string(), target })
        })
        .collect()
}

/// Classify every reference token in `value` as local or remote
pub fn extract_references(value: &str) -> ExtractedReferences {
    let mut extracted = ExtractedReferences::default();
    for token in scan_tokens(value) {
        match token.target {
            TokenTarget::Local { secret_key } => extracted.local.push(secret_key),
            TokenTarget::Remote(remote) => {
                if !extracted.remote.contains(&remote) {
                    extracted.remote.push(remote);
                }
            }
        }
    }
    extracted
}

/// Whether `value` contains at least one reference token
pub fn has_references(value: &str) -> bool {
    !scan_tokens(value).is_empty()
}

/// Reference edges for a secret stored at `environment`/`secret_path`.
///
/// Local references are stored with the owner's own environment and path so
/// every edge names a concrete logical address.
pub fn reference_edges(
    secret_id: &SecretId,
    environment: &str,
    secret_path: &str,
    value: &str,
) -> Vec<SecretReference> {
    let mut seen = HashSet::new();
    scan_tokens(value)
        .iter()
        .map(|token| token.resolve(environment, secret_path))
        .filter(|address| seen.insert(address.clone()))
        .map(|(environment, secret_path, secret_key)| SecretReference {
            secret_id: secret_id.clone(),
            environment,
            secret_path,
            secret_key,
        })
        .collect()
}

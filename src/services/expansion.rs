//! Secret reference expansion
//!
//! Resolves `${KEY}` and `${env.path.KEY}` tokens into concrete values.
//!
//! ## Algorithm
//!
//! Expansion walks the reference graph with an explicit stack of frames. Each
//! frame carries its own visited set, so cycles are detected per path rather
//! than globally. Every token of a frame is substituted into one running
//! accumulator seeded from the original value. A referenced value is expanded
//! further only if it is not part of a cycle, where "cycle" includes the
//! one-step lookahead: a value whose own tokens point back into the visited
//! set is substituted verbatim. Frames deeper than
//! [`MAX_SECRET_REFERENCE_DEPTH`] are dropped, leaving their tokens in place.
//!
//! Missing references expand to the empty string. A denied reference aborts
//! the whole call with `Forbidden`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    domain::{has_references, normalize_secret_path, scan_tokens, ProjectId},
    errors::{KeyplaneError, Result},
    observability::MetricsRecorder,
    services::collaborators::ExpansionPermission,
    services::secret_encryption::SecretCipher,
    storage::{FolderRepository, SecretQuery, SecretRepository},
};

/// Maximum nesting depth followed during expansion.
///
/// Depth is counted from the root frame, which sits at depth 0 and is
/// scanned like any other frame. A frame is dropped only once its depth
/// exceeds this value, so a chain substitutes `MAX_SECRET_REFERENCE_DEPTH + 1`
/// tokens before the remaining ones are left in place.
pub const MAX_SECRET_REFERENCE_DEPTH: usize = 10;

/// A decrypted secret as seen by the expander
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub value: String,
    pub tag_slugs: Vec<String>,
}

/// Supplies the decrypted shared secrets of one folder
#[async_trait]
pub trait FolderSecretSource: Send + Sync {
    /// Secrets of the folder at `secret_path` in `environment`, keyed by
    /// secret key. A missing folder yields an empty map.
    async fn load_folder(
        &self,
        environment: &str,
        secret_path: &str,
    ) -> Result<HashMap<String, ResolvedSecret>>;
}

/// Database-backed [`FolderSecretSource`] scoped to one project
#[derive(Clone)]
pub struct DbFolderSecretSource {
    project_id: ProjectId,
    folders: FolderRepository,
    secrets: SecretRepository,
    cipher: Arc<dyn SecretCipher>,
}

impl DbFolderSecretSource {
    pub fn new(
        project_id: ProjectId,
        folders: FolderRepository,
        secrets: SecretRepository,
        cipher: Arc<dyn SecretCipher>,
    ) -> Self {
        Self { project_id, folders, secrets, cipher }
    }
}

#[async_trait]
impl FolderSecretSource for DbFolderSecretSource {
    async fn load_folder(
        &self,
        environment: &str,
        secret_path: &str,
    ) -> Result<HashMap<String, ResolvedSecret>> {
        let Some(folder) = self.folders.find_by_secret_path(&self.project_id, environment, secret_path).await?
        else {
            return Ok(HashMap::new());
        };

        let secrets = self.secrets.find_by_folder_id(&folder.id, &SecretQuery::default()).await?;
        secrets
            .into_iter()
            .map(|secret| {
                let value = self.cipher.decrypt_to_string(&secret.encrypted_value)?;
                let tag_slugs = secret.tag_slugs();
                Ok((secret.key, ResolvedSecret { value, tag_slugs }))
            })
            .collect()
    }
}

/// One node of a reference trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceTreeNode {
    pub key: String,
    pub value: String,
    pub environment: String,
    pub secret_path: String,
    pub children: Vec<ReferenceTreeNode>,
}

/// Result of [`SecretExpander::expand_with_trace`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceTrace {
    pub expanded_value: String,
    pub tree: ReferenceTreeNode,
}

#[derive(Debug)]
struct TraceSlot {
    key: String,
    value: String,
    environment: String,
    secret_path: String,
    children: Vec<usize>,
}

fn build_tree(arena: &[TraceSlot], index: usize) -> ReferenceTreeNode {
    let slot = &arena[index];
    ReferenceTreeNode {
        key: slot.key.clone(),
        value: slot.value.clone(),
        environment: slot.environment.clone(),
        secret_path: slot.secret_path.clone(),
        children: slot.children.iter().map(|child| build_tree(arena, *child)).collect(),
    }
}

struct Frame {
    value: String,
    environment: String,
    secret_path: String,
    secret_key: String,
    depth: usize,
    visited: HashSet<String>,
    node: usize,
}

fn address(environment: &str, secret_path: &str, secret_key: &str) -> String {
    format!("{}:{}:{}", environment, secret_path, secret_key)
}

type FolderCache = HashMap<(String, String), Arc<HashMap<String, ResolvedSecret>>>;

/// Expands reference tokens using a folder source and a permission predicate
#[derive(Clone)]
pub struct SecretExpander {
    source: Arc<dyn FolderSecretSource>,
    permission: Arc<dyn ExpansionPermission>,
    metrics: MetricsRecorder,
}

impl SecretExpander {
    pub fn new(source: Arc<dyn FolderSecretSource>, permission: Arc<dyn ExpansionPermission>) -> Self {
        Self { source, permission, metrics: MetricsRecorder::new() }
    }

    /// Fully expand `value`, owned by `secret_key` at `environment`/`secret_path`
    #[instrument(skip(self, value), fields(environment = %environment, secret_path = %secret_path))]
    pub async fn expand(
        &self,
        value: &str,
        environment: &str,
        secret_path: &str,
        secret_key: &str,
    ) -> Result<String> {
        if !has_references(value) {
            return Ok(value.to_string());
        }
        let (expanded, _) = self.run(value, environment, secret_path, secret_key).await?;
        Ok(expanded)
    }

    /// Expand `value` and return the tree of references that was followed
    #[instrument(skip(self, value), fields(environment = %environment, secret_path = %secret_path))]
    pub async fn expand_with_trace(
        &self,
        value: &str,
        environment: &str,
        secret_path: &str,
        secret_key: &str,
    ) -> Result<ReferenceTrace> {
        let (expanded_value, arena) = self.run(value, environment, secret_path, secret_key).await?;
        Ok(ReferenceTrace { expanded_value, tree: build_tree(&arena, 0) })
    }

    async fn run(
        &self,
        value: &str,
        environment: &str,
        secret_path: &str,
        secret_key: &str,
    ) -> Result<(String, Vec<TraceSlot>)> {
        let started = Instant::now();
        let secret_path = normalize_secret_path(secret_path);
        let mut cache = FolderCache::new();
        let mut followed = 0usize;

        let mut arena = vec![TraceSlot {
            key: secret_key.to_string(),
            value: value.to_string(),
            environment: environment.to_string(),
            secret_path: secret_path.clone(),
            children: Vec::new(),
        }];

        let mut accumulator = value.to_string();
        let mut stack = vec![Frame {
            value: value.to_string(),
            environment: environment.to_string(),
            secret_path: secret_path.clone(),
            secret_key: secret_key.to_string(),
            depth: 0,
            visited: HashSet::from([address(environment, &secret_path, secret_key)]),
            node: 0,
        }];

        while let Some(frame) = stack.pop() {
            if frame.depth > MAX_SECRET_REFERENCE_DEPTH {
                debug!(secret_key = %frame.secret_key, depth = frame.depth, "Reference depth limit reached");
                self.metrics.record_depth_limit_hit();
                continue;
            }

            for token in scan_tokens(&frame.value) {
                let (ref_env, ref_path, ref_key) = token.resolve(&frame.environment, &frame.secret_path);
                let folder = self.load_cached(&mut cache, &ref_env, &ref_path).await?;
                let referenced = folder.get(&ref_key);

                let tag_slugs = referenced.map(|secret| secret.tag_slugs.as_slice()).unwrap_or(&[]);
                if !self.permission.can_expand_value(&ref_env, &ref_path, &ref_key, tag_slugs).await {
                    return Err(KeyplaneError::forbidden(format!(
                        "You are attempting to reference secret named {} from environment {} in path {}, \
                         which you do not have access to (referenced by {} in environment {}, path {})",
                        ref_key,
                        ref_env,
                        ref_path,
                        frame.secret_key,
                        frame.environment,
                        frame.secret_path
                    )));
                }

                let ref_value = referenced.map(|secret| secret.value.clone()).unwrap_or_default();
                let ref_address = address(&ref_env, &ref_path, &ref_key);
                followed += 1;

                let circular = frame.visited.contains(&ref_address)
                    || scan_tokens(&ref_value).iter().any(|next| {
                        let (env, path, key) = next.resolve(&ref_env, &ref_path);
                        let next_address = address(&env, &path, &key);
                        next_address == ref_address || frame.visited.contains(&next_address)
                    });

                let child = arena.len();
                arena.push(TraceSlot {
                    key: ref_key.clone(),
                    value: ref_value.clone(),
                    environment: ref_env.clone(),
                    secret_path: ref_path.clone(),
                    children: Vec::new(),
                });
                arena[frame.node].children.push(child);

                if circular {
                    debug!(secret_key = %ref_key, environment = %ref_env, "Circular reference left unexpanded");
                    self.metrics.record_circular_reference();
                } else if has_references(&ref_value) {
                    let mut visited = frame.visited.clone();
                    visited.insert(ref_address);
                    stack.push(Frame {
                        value: ref_value.clone(),
                        environment: ref_env,
                        secret_path: ref_path,
                        secret_key: ref_key,
                        depth: frame.depth + 1,
                        visited,
                        node: child,
                    });
                }

                accumulator = accumulator.replace(&token.raw, &ref_value);
            }
        }

        self.metrics.record_expansion(followed, started.elapsed().as_secs_f64());
        Ok((accumulator, arena))
    }

    async fn load_cached(
        &self,
        cache: &mut FolderCache,
        environment: &str,
        secret_path: &str,
    ) -> Result<Arc<HashMap<String, ResolvedSecret>>> {
        let cache_key = (environment.to_string(), secret_path.to_string());
        if let Some(folder) = cache.get(&cache_key) {
            return Ok(Arc::clone(folder));
        }

        let folder = Arc::new(self.source.load_folder(environment, secret_path).await?);
        cache.insert(cache_key, Arc::clone(&folder));
        Ok(folder)
    }
}

impl std::fmt::Debug for SecretExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretExpander").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::collaborators::AllowAllExpansion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StaticSource {
        folders: HashMap<(String, String), HashMap<String, ResolvedSecret>>,
        loads: AtomicUsize,
    }

    impl StaticSource {
        fn with(mut self, environment: &str, path: &str, key: &str, value: &str) -> Self {
            self.folders
                .entry((environment.to_string(), path.to_string()))
                .or_default()
                .insert(key.to_string(), ResolvedSecret { value: value.to_string(), tag_slugs: Vec::new() });
            self
        }

        fn tagged(mut self, environment: &str, path: &str, key: &str, value: &str, tag: &str) -> Self {
            self.folders.entry((environment.to_string(), path.to_string())).or_default().insert(
                key.to_string(),
                ResolvedSecret { value: value.to_string(), tag_slugs: vec![tag.to_string()] },
            );
            self
        }
    }

    #[async_trait]
    impl FolderSecretSource for StaticSource {
        async fn load_folder(
            &self,
            environment: &str,
            secret_path: &str,
        ) -> Result<HashMap<String, ResolvedSecret>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .folders
                .get(&(environment.to_string(), secret_path.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    struct DenyTag(&'static str);

    #[async_trait]
    impl ExpansionPermission for DenyTag {
        async fn can_expand_value(&self, _: &str, _: &str, _: &str, tag_slugs: &[String]) -> bool {
            !tag_slugs.iter().any(|tag| tag == self.0)
        }
    }

    fn expander(source: StaticSource) -> SecretExpander {
        SecretExpander::new(Arc::new(source), Arc::new(AllowAllExpansion))
    }

    #[tokio::test]
    async fn plain_value_is_untouched() {
        let result = expander(StaticSource::default()).expand("plain", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "plain");
    }

    #[tokio::test]
    async fn expands_local_reference() {
        let source = StaticSource::default().with("dev", "/", "A", "${B}").with("dev", "/", "B", "b-value");
        let result = expander(source).expand("${B}", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "b-value");
    }

    #[tokio::test]
    async fn expands_nested_and_cross_environment_references() {
        let source = StaticSource::default()
            .with("dev", "/", "URL", "postgres://${USER}@${prod.db.HOST}")
            .with("dev", "/", "USER", "admin")
            .with("prod", "/db", "HOST", "${PORTLESS}")
            .with("prod", "/db", "PORTLESS", "db.internal");

        let result = expander(source)
            .expand("postgres://${USER}@${prod.db.HOST}", "dev", "/", "URL")
            .await
            .unwrap();
        assert_eq!(result, "postgres://admin@db.internal");
    }

    #[tokio::test]
    async fn missing_reference_expands_to_empty() {
        let result = expander(StaticSource::default()).expand("x${NOPE}y", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "xy");
    }

    #[tokio::test]
    async fn two_node_cycle_stops_at_lookahead() {
        let source = StaticSource::default().with("dev", "/", "A", "${B}").with("dev", "/", "B", "${A}");
        let result = expander(source).expand("${B}", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "${A}");
    }

    #[tokio::test]
    async fn self_reference_is_left_in_place() {
        let source = StaticSource::default().with("dev", "/", "A", "${A}");
        let result = expander(source).expand("${A}", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "${A}");
    }

    #[tokio::test]
    async fn depth_bound_leaves_deep_tokens() {
        let mut source = StaticSource::default();
        for i in 0..14 {
            source = source.with("dev", "/", &format!("S{}", i), &format!("${{S{}}}", i + 1));
        }
        source = source.with("dev", "/", "S14", "end");

        // S0 is the root frame at depth 0; frames up to depth 10 are scanned,
        // so tokens S1 through S11 are substituted and S12 stays literal.
        let result = expander(source).expand("${S1}", "dev", "/", "S0").await.unwrap();
        assert_eq!(result, "${S12}");
    }

    #[tokio::test]
    async fn shallow_chain_fully_expands() {
        let source = StaticSource::default()
            .with("dev", "/", "A", "${B}")
            .with("dev", "/", "B", "${C}")
            .with("dev", "/", "C", "c");
        let result = expander(source).expand("${B}", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "c");
    }

    #[tokio::test]
    async fn forbidden_reference_fails_whole_call() {
        let source = StaticSource::default()
            .with("dev", "/", "OPEN", "ok")
            .tagged("dev", "/", "LOCKED", "secret", "restricted");
        let expander = SecretExpander::new(Arc::new(source), Arc::new(DenyTag("restricted")));

        let err = expander.expand("${OPEN}-${LOCKED}", "dev", "/", "A").await.unwrap_err();
        match err {
            KeyplaneError::Forbidden { message } => {
                assert!(message.contains("LOCKED"));
                assert!(message.contains("referenced by A"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn folders_are_loaded_once_per_call() {
        let source = Arc::new(
            StaticSource::default()
                .with("dev", "/", "B", "b")
                .with("dev", "/", "C", "c"),
        );
        let expander = SecretExpander::new(source.clone(), Arc::new(AllowAllExpansion));

        let result = expander.expand("${B}${C}${B}", "dev", "/", "A").await.unwrap();
        assert_eq!(result, "bcb");
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        expander.expand("${B}", "dev", "/", "A").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trace_mirrors_followed_references() {
        let source = StaticSource::default()
            .with("dev", "/", "B", "${C}")
            .with("dev", "/", "C", "c")
            .with("prod", "/", "D", "d");
        let trace = expander(source)
            .expand_with_trace("${B}+${prod.D}", "dev", "/", "A")
            .await
            .unwrap();

        assert_eq!(trace.expanded_value, "c+d");
        assert_eq!(trace.tree.key, "A");
        assert_eq!(trace.tree.children.len(), 2);
        assert_eq!(trace.tree.children[0].key, "B");
        assert_eq!(trace.tree.children[0].children[0].key, "C");
        assert_eq!(trace.tree.children[1].environment, "prod");
    }
}

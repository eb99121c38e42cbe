//! Folder hierarchy domain types
//!
//! An environment owns a tree of folders. The single folder without a parent
//! is named `root` and renders as the path `/`; every other folder's path is
//! the `/`-joined chain of ancestor names below the root.

use super::id::{EnvironmentId, FolderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Name of the root folder of every environment
pub const ROOT_FOLDER_NAME: &str = "root";

/// Path rendered for the root folder
pub const ROOT_PATH: &str = "/";

/// Deepest folder level walked when materializing paths
pub const MAX_FOLDER_DEPTH: usize = 20;

/// A node in an environment's path tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub parent_id: Option<FolderId>,
    pub environment_id: EnvironmentId,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Folder {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A materialized folder path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderPath {
    pub path: String,
    pub folder_id: FolderId,
}

/// Normalize a user supplied secret path.
///
/// Collapses repeated separators, drops `.` segments and trailing slashes and
/// always returns an absolute path. The empty string and `/root` style input
/// are not special-cased: `""` becomes `/`.
pub fn normalize_secret_path(path: &str) -> String {
    let segments = path_segments(path);
    if segments.is_empty() {
        ROOT_PATH.to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Split a path into its non-empty segments
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty() && *segment != ".").collect()
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether `path` equals `prefix` or lies below it, segment-wise
pub fn is_path_under(path: &str, prefix: &str) -> bool {
    let path = normalize_secret_path(path);
    let prefix = normalize_secret_path(prefix);
    if prefix == ROOT_PATH || path == prefix {
        return true;
    }
    path.strip_prefix(&prefix).is_some_and(|rest| rest.starts_with('/'))
}

/// Validate a folder name before it is created
pub fn validate_folder_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Folder name cannot be empty".to_string());
    }
    if name.contains('/') {
        return Err(format!("Folder name '{}' cannot contain '/'", name));
    }
    if name == "." || name == ".." {
        return Err(format!("Folder name '{}' is reserved", name));
    }
    Ok(())
}

/// Materialize every folder of one environment into `(path, folder_id)` pairs
/// and keep those at or below `prefix`.
///
/// Folders are grouped by parent, then walked depth-first from the root in name
/// order. A branch that would go deeper than [`MAX_FOLDER_DEPTH`] is cut off
/// and logged; the rest of the tree is still returned.
pub fn build_folder_paths(folders: &[Folder], prefix: &str) -> Vec<FolderPath> {
    let mut children: HashMap<Option<&FolderId>, Vec<&Folder>> = HashMap::new();
    for folder in folders {
        children.entry(folder.parent_id.as_ref()).or_default().push(folder);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let mut paths = Vec::with_capacity(folders.len());
    if let Some(roots) = children.get(&None) {
        for root in roots {
            walk(root, ROOT_PATH.to_string(), 0, &children, &mut paths);
        }
    }

    paths.retain(|entry| is_path_under(&entry.path, prefix));
    paths
}

fn walk(
    folder: &Folder,
    path: String,
    depth: usize,
    children: &HashMap<Option<&FolderId>, Vec<&Folder>>,
    out: &mut Vec<FolderPath>,
) {
    if let Some(kids) = children.get(&Some(&folder.id)) {
        out.push(FolderPath { path: path.clone(), folder_id: folder.id.clone() });

        if depth >= MAX_FOLDER_DEPTH {
            warn!(
                folder_id = %folder.id,
                path = %path,
                skipped_children = kids.len(),
                max_depth = MAX_FOLDER_DEPTH,
                "Folder tree exceeds maximum depth, skipping deeper branch"
            );
            return;
        }

        for child in kids {
            walk(child, join_path(&path, &child.name), depth + 1, children, out);
        }
    } else {
        out.push(FolderPath { path, folder_id: folder.id.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(id: &str, name: &str, parent: Option<&str>) -> Folder {
        Folder {
            id: FolderId::from_str_unchecked(id),
            name: name.to_string(),
            parent_id: parent.map(FolderId::from_str_unchecked),
            environment_id: EnvironmentId::from_str_unchecked("env"),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_secret_path(""), "/");
        assert_eq!(normalize_secret_path("/"), "/");
        assert_eq!(normalize_secret_path("//"), "/");
        assert_eq!(normalize_secret_path("app/api/"), "/app/api");
        assert_eq!(normalize_secret_path("/app//./api"), "/app/api");
    }

    #[test]
    fn path_under_is_segment_aware() {
        assert!(is_path_under("/a/b", "/a"));
        assert!(is_path_under("/a", "/a"));
        assert!(is_path_under("/anything", "/"));
        assert!(!is_path_under("/ab", "/a"));
        assert!(!is_path_under("/", "/a"));
    }

    #[test]
    fn rejects_invalid_folder_names() {
        assert!(validate_folder_name("").is_err());
        assert!(validate_folder_name("   ").is_err());
        assert!(validate_folder_name("a/b").is_err());
        assert!(validate_folder_name("..").is_err());
        assert!(validate_folder_name("api").is_ok());
    }

    #[test]
    fn lists_root_then_children_depth_first() {
        let folders = vec![
            folder("b", "b", Some("a")),
            folder("root", ROOT_FOLDER_NAME, None),
            folder("a", "a", Some("root")),
        ];

        let paths: Vec<String> =
            build_folder_paths(&folders, "/").into_iter().map(|p| p.path).collect();
        assert_eq!(paths, vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn filters_by_prefix() {
        let folders = vec![
            folder("root", ROOT_FOLDER_NAME, None),
            folder("a", "a", Some("root")),
            folder("ab", "ab", Some("root")),
            folder("c", "c", Some("a")),
        ];

        let paths = build_folder_paths(&folders, "/a");
        let rendered: Vec<&str> = paths.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(rendered, vec!["/a", "/a/c"]);
        assert_eq!(paths[1].folder_id.as_str(), "c");
    }

    #[test]
    fn cuts_branches_deeper_than_limit() {
        let mut folders = vec![folder("f0", ROOT_FOLDER_NAME, None)];
        for i in 1..=30 {
            folders.push(folder(&format!("f{i}"), &format!("n{i}"), Some(&format!("f{}", i - 1))));
        }

        let paths = build_folder_paths(&folders, "/");
        assert_eq!(paths.len(), MAX_FOLDER_DEPTH + 1);
        let deepest = paths.last().map(|p| p.path.clone()).unwrap_or_default();
        assert_eq!(path_segments(&deepest).len(), MAX_FOLDER_DEPTH);
    }
}

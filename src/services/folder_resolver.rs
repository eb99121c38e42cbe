//! Folder hierarchy resolution
//!
//! Maps human-readable secret paths onto folder ids and back.

use tracing::{debug, info, instrument};

use crate::{
    domain::{
        build_folder_paths, folder::path_segments, normalize_secret_path, EnvironmentId, Folder,
        FolderId, FolderPath, ProjectId,
    },
    errors::{KeyplaneError, Result},
    storage::FolderRepository,
};

/// Resolves paths within one environment's folder tree
#[derive(Debug, Clone)]
pub struct FolderHierarchyResolver {
    folders: FolderRepository,
}

impl FolderHierarchyResolver {
    pub fn new(folders: FolderRepository) -> Self {
        Self { folders }
    }

    /// Folder id at `secret_path`, or `NotFound`
    #[instrument(skip(self), fields(environment_id = %environment_id))]
    pub async fn resolve_path(&self, environment_id: &EnvironmentId, secret_path: &str) -> Result<FolderId> {
        let path = normalize_secret_path(secret_path);
        let mut current = self
            .folders
            .find_root(environment_id)
            .await?
            .ok_or_else(|| KeyplaneError::not_found("Folder", path.as_str()))?;

        for segment in path_segments(&path) {
            current = self
                .folders
                .find_child(&current.id, segment)
                .await?
                .ok_or_else(|| KeyplaneError::not_found("Folder", path.as_str()))?;
        }

        Ok(current.id)
    }

    /// Every folder whose path equals or descends from `prefix`, in
    /// depth-first order with siblings sorted by name
    #[instrument(skip(self), fields(environment_id = %environment_id))]
    pub async fn list_paths_under(
        &self,
        environment_id: &EnvironmentId,
        prefix: &str,
    ) -> Result<Vec<FolderPath>> {
        let folders = self.folders.find_by_environment(environment_id).await?;
        let paths = build_folder_paths(&folders, prefix);
        debug!(folder_count = folders.len(), path_count = paths.len(), "Materialized folder paths");
        Ok(paths)
    }

    /// Folder at `secret_path` in the environment with the given slug
    pub async fn find_by_secret_path(
        &self,
        project_id: &ProjectId,
        environment_slug: &str,
        secret_path: &str,
    ) -> Result<Option<Folder>> {
        self.folders.find_by_secret_path(project_id, environment_slug, secret_path).await
    }

    /// Like [`Self::find_by_secret_path`] but fails with `NotFound`
    pub async fn require_by_secret_path(
        &self,
        project_id: &ProjectId,
        environment_slug: &str,
        secret_path: &str,
    ) -> Result<Folder> {
        self.find_by_secret_path(project_id, environment_slug, secret_path)
            .await?
            .ok_or_else(|| {
                KeyplaneError::not_found(
                    "Folder",
                    format!("{} in environment {}", normalize_secret_path(secret_path), environment_slug),
                )
            })
    }

    /// Walk `secret_path`, creating any missing folders along the way
    #[instrument(skip(self), fields(environment_id = %environment_id))]
    pub async fn ensure_path(&self, environment_id: &EnvironmentId, secret_path: &str) -> Result<Folder> {
        let path = normalize_secret_path(secret_path);
        let mut current = self
            .folders
            .find_root(environment_id)
            .await?
            .ok_or_else(|| KeyplaneError::not_found("Environment root folder", environment_id.as_str()))?;

        for segment in path_segments(&path) {
            current = match self.folders.find_child(&current.id, segment).await? {
                Some(child) => child,
                None => {
                    let created = self.folders.create(environment_id, &current.id, segment).await?;
                    info!(folder_id = %created.id, folder_name = %created.name, "Folder created");
                    created
                }
            };
        }

        Ok(current)
    }
}

//! Storage collaborators of the size quota: reading a project's size and
//! listing the projects that exist.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::StorageError;

/// Reads the on-disk size of a project
#[async_trait]
pub trait RepoSizeProbe: Send + Sync {
    /// Size in bytes; [`StorageError::NotFound`] if the project has no
    /// repository yet
    async fn size_of(&self, project: &str) -> Result<u64, StorageError>;
}

/// Lists existing projects
#[async_trait]
pub trait ProjectLister: Send + Sync {
    async fn projects(&self) -> Result<Vec<String>, StorageError>;
}

/// Size probe summing the files of a bare repository below a root directory.
///
/// Project `team/app` is looked up as `<root>/team/app.git`, then
/// `<root>/team/app`.
#[derive(Debug, Clone)]
pub struct FsRepoSizeProbe {
    root: PathBuf,
}

impl FsRepoSizeProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Repository directory of `project`, if one exists
    pub fn repo_path(&self, project: &str) -> Option<PathBuf> {
        let project = project.trim_matches('/');
        if project.is_empty() || project.split('/').any(|seg| seg == "..") {
            return None;
        }
        let bare = self.root.join(format!("{}.git", project));
        if bare.is_dir() {
            return Some(bare);
        }
        let plain = self.root.join(project);
        plain.is_dir().then_some(plain)
    }
}

fn dir_size(path: &Path) -> Result<u64, StorageError> {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(path).to_path_buf();
            StorageError::Io {
                path,
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop")),
            }
        })?;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|e| StorageError::Io {
                path: entry.path().to_path_buf(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "metadata")),
            })?;
            total += metadata.len();
        }
    }
    Ok(total)
}

fn list_repos(root: &Path) -> Result<Vec<String>, StorageError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut projects = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| StorageError::Io {
            path: root.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop")),
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = relative.to_string_lossy().replace('\\', "/");
        if let Some(project) = name.strip_suffix(".git") {
            projects.push(project.to_string());
            walker.skip_current_dir();
        }
    }
    projects.sort();
    Ok(projects)
}

#[async_trait]
impl RepoSizeProbe for FsRepoSizeProbe {
    async fn size_of(&self, project: &str) -> Result<u64, StorageError> {
        let Some(path) = self.repo_path(project) else {
            return Err(StorageError::NotFound(project.to_string()));
        };

        tokio::task::spawn_blocking(move || dir_size(&path))
            .await
            .map_err(|e| StorageError::Probe {
                project: project.to_string(),
                reason: e.to_string(),
            })?
    }
}

/// Every `*.git` directory below the root is a project
#[async_trait]
impl ProjectLister for FsRepoSizeProbe {
    async fn projects(&self) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_repos(&root))
            .await
            .map_err(|e| StorageError::Probe {
                project: "*".to_string(),
                reason: e.to_string(),
            })?
    }
}

/// Project list kept in memory and updated by the host
#[derive(Debug, Default)]
pub struct ProjectList {
    projects: RwLock<BTreeSet<String>>,
}

impl ProjectList {
    pub fn new<I, S>(projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            projects: RwLock::new(projects.into_iter().map(Into::into).collect()),
        }
    }

    pub fn add(&self, project: &str) -> bool {
        self.projects.write().insert(project.to_string())
    }

    pub fn remove(&self, project: &str) -> bool {
        self.projects.write().remove(project)
    }
}

#[async_trait]
impl ProjectLister for ProjectList {
    async fn projects(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.projects.read().iter().cloned().collect())
    }
}

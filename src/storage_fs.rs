//! Local filesystem object store.
//!
//! Treats files under `root` as objects whose keys are their `/`-separated
//! paths relative to `root`. Used for local runs against the SQLite
//! warehouse and for tests.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::config::FilesystemStorageConfig;
use crate::error::{LoadError, Step};
use crate::models::ObjectDescriptor;
use crate::storage::{relative_key, KeyFilter, ObjectStore};

pub struct FsStore {
    config: FilesystemStorageConfig,
    filter: KeyFilter,
}

impl FsStore {
    pub fn new(config: FilesystemStorageConfig) -> Result<Self> {
        if !config.root.exists() {
            bail!(
                "Filesystem storage root does not exist: {}",
                config.root.display()
            );
        }
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.clone());
        let filter = KeyFilter::new(&config.include_globs, &excludes)?;
        Ok(Self { config, filter })
    }

    /// Resolve a key under the root, refusing anything that would escape it.
    fn path_for(&self, step: Step, key: &str) -> Result<PathBuf, LoadError> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(LoadError::fatal(step, format!("invalid object key '{}'", key)));
        }
        Ok(self.config.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list(&self) -> Result<Vec<ObjectDescriptor>, LoadError> {
        let root = self.config.root.clone();
        let prefix = self.config.prefix.clone();
        let follow = self.config.follow_symlinks;
        let filter = self.filter.clone();

        let walked = tokio::task::spawn_blocking(move || walk(&root, &prefix, follow, &filter))
            .await
            .map_err(|e| LoadError::fatal(Step::List, e.to_string()))?;

        let mut objects = walked?;
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn size_of(&self, key: &str) -> Result<u64, LoadError> {
        let path = self.path_for(Step::Size, key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| LoadError::from_io(Step::Size, e))?;
        Ok(metadata.len())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, LoadError> {
        let path = self.path_for(Step::Fetch, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| LoadError::from_io(Step::Fetch, e))
    }

    fn location(&self, key: &str) -> String {
        format!("file://{}", self.config.root.join(key).display())
    }

    async fn archive(&self, key: &str, archive_key: &str) -> Result<(), LoadError> {
        let from = self.path_for(Step::Archive, key)?;
        let to = self.path_for(Step::Archive, archive_key)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LoadError::from_io(Step::Archive, e))?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| LoadError::from_io(Step::Archive, e))
    }
}

fn walk(
    root: &Path,
    prefix: &str,
    follow_symlinks: bool,
    filter: &KeyFilter,
) -> Result<Vec<ObjectDescriptor>, LoadError> {
    let start = root.join(prefix);
    if !start.exists() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(&start).follow_links(follow_symlinks) {
        let entry = entry.map_err(|e| LoadError::fatal(Step::List, e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !filter.matches(relative_key(&key, prefix)) {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| LoadError::fatal(Step::List, e.to_string()))?;
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        objects.push(ObjectDescriptor {
            key,
            size: metadata.len(),
            last_modified,
        });
    }
    Ok(objects)
}

//! Object storage abstraction.
//!
//! [`ObjectStore`] is the seam between the loader and where input objects
//! live. Built-in implementations:
//!
//! | Backend | Type | Location form |
//! |---------|------|---------------|
//! | `s3` | [`crate::storage_s3::S3Store`] | `s3://<bucket>/<key>` |
//! | `filesystem` | [`crate::storage_fs::FsStore`] | `file://<root>/<key>` |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::Config;
use crate::error::LoadError;
use crate::models::ObjectDescriptor;
use crate::storage_fs::FsStore;
use crate::storage_s3::S3Store;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// List every candidate object under the configured prefix, after
    /// include/exclude filtering, sorted by key.
    async fn list(&self) -> Result<Vec<ObjectDescriptor>, LoadError>;

    /// Current byte size of one object.
    async fn size_of(&self, key: &str) -> Result<u64, LoadError>;

    /// Full object content.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, LoadError>;

    /// Location string a warehouse can pull the object from.
    fn location(&self, key: &str) -> String;

    /// Move an object to `archive_key`.
    async fn archive(&self, key: &str, archive_key: &str) -> Result<(), LoadError>;
}

/// Build the store named by `storage.backend`.
pub fn create_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.storage.backend.as_str() {
        "s3" => {
            let s3 = config
                .storage
                .s3
                .clone()
                .ok_or_else(|| anyhow::anyhow!("S3 storage not configured"))?;
            Ok(Arc::new(S3Store::from_env(s3)?))
        }
        "filesystem" => {
            let fs = config
                .storage
                .filesystem
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Filesystem storage not configured"))?;
            Ok(Arc::new(FsStore::new(fs)?))
        }
        other => anyhow::bail!("Unknown storage backend: '{}'", other),
    }
}

/// Include/exclude filter over keys relative to the listing prefix.
#[derive(Clone)]
pub struct KeyFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl KeyFilter {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(exclude_globs)?,
        })
    }

    pub fn matches(&self, relative_key: &str) -> bool {
        !self.exclude.is_match(relative_key) && self.include.is_match(relative_key)
    }
}

/// Strip `prefix` (and a following `/`) from `key`.
pub fn relative_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return key;
    }
    let prefix = prefix.trim_end_matches('/');
    key.strip_prefix(prefix)
        .map(|s| s.trim_start_matches('/'))
        .unwrap_or(key)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_key_strips_prefix() {
        assert_eq!(relative_key("data/input/a.csv", "data/input/"), "a.csv");
        assert_eq!(relative_key("data/input/a.csv", ""), "data/input/a.csv");
        assert_eq!(relative_key("other/a.csv", "data/"), "other/a.csv");
    }

    #[test]
    fn filter_applies_excludes_first() {
        let filter = KeyFilter::new(
            &["**/*.csv".to_string(), "**/*.json".to_string()],
            &["tmp/**".to_string()],
        )
        .unwrap();
        assert!(filter.matches("2024/a.csv"));
        assert!(filter.matches("b.json"));
        assert!(!filter.matches("tmp/a.csv"));
        assert!(!filter.matches("a.parquet"));
    }
}

//! On-disk cache of source-agnostic operation claims.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::messages::OperationClaim;

const DEFAULT_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClaimsCacheEntry {
    plugin_path: PathBuf,
    claims: Vec<OperationClaim>,
    last_updated: DateTime<Utc>,
}

/// One JSON file per plugin, named by a hash of the plugin path.
#[derive(Debug, Clone)]
pub struct ClaimsCacheStore {
    dir: PathBuf,
    max_age: Duration,
}

impl ClaimsCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn entry_path(&self, plugin: &Path) -> PathBuf {
        let digest = Sha256::digest(plugin.to_string_lossy().as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// Cached claims, unless the entry is missing, unreadable, expired, or
    /// older than the plugin file itself.
    pub fn load(&self, plugin: &Path) -> Option<Vec<OperationClaim>> {
        let raw = std::fs::read_to_string(self.entry_path(plugin)).ok()?;
        let entry: ClaimsCacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, plugin = %plugin.display(), "Ignoring corrupt claims cache entry");
                return None;
            }
        };

        if entry.plugin_path != plugin || Utc::now() - entry.last_updated > self.max_age {
            return None;
        }
        let modified = std::fs::metadata(plugin)
            .and_then(|metadata| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        if modified.is_some_and(|modified| modified > entry.last_updated) {
            return None;
        }
        Some(entry.claims)
    }

    pub fn store(&self, plugin: &Path, claims: &[OperationClaim]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let entry = ClaimsCacheEntry {
            plugin_path: plugin.to_path_buf(),
            claims: claims.to_vec(),
            last_updated: Utc::now(),
        };
        let target = self.entry_path(plugin);
        let staging = target.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(&entry)?)?;
        std::fs::rename(&staging, &target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_then_load() {
        let temp = TempDir::new().unwrap();
        let plugin = temp.path().join("nuget-plugin-feed");
        std::fs::write(&plugin, b"bin").unwrap();
        let store = ClaimsCacheStore::new(temp.path().join("cache"));

        assert!(store.load(&plugin).is_none());
        store
            .store(&plugin, &[OperationClaim::Authentication])
            .unwrap();
        assert_eq!(store.load(&plugin), Some(vec![OperationClaim::Authentication]));
    }

    #[test]
    fn test_expired_entry_is_ignored() {
        let temp = TempDir::new().unwrap();
        let plugin = temp.path().join("nuget-plugin-feed");
        let store = ClaimsCacheStore::new(temp.path()).with_max_age(Duration::seconds(-1));

        store
            .store(&plugin, &[OperationClaim::DownloadPackage])
            .unwrap();
        assert!(store.load(&plugin).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_ignored() {
        let temp = TempDir::new().unwrap();
        let plugin = Path::new("/plugins/nuget-plugin-feed");
        let store = ClaimsCacheStore::new(temp.path());

        std::fs::write(store.entry_path(plugin), b"{ not json").unwrap();
        assert!(store.load(plugin).is_none());
    }
}

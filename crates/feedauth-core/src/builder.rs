//! Provider builders
//!
//! Both builders return providers ordered by directory, in the order the
//! directories were found, then case-insensitively by file name.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use feedauth_plugins::env::{CREDENTIAL_PROVIDER_TIMEOUT, CREDENTIAL_PROVIDERS_PATH, parse_seconds};
use feedauth_plugins::{EnvironmentReader, PluginManager};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;
use crate::legacy::PluginCredentialProvider;
use crate::provider::CredentialProvider;
use crate::secure::SecurePluginCredentialProvider;
use crate::settings::FeedAuthSettings;

pub const DEFAULT_PROVIDER_TIMEOUT_SECONDS: u64 = 300;

const LEGACY_PREFIX: &str = "credentialprovider";
const LEGACY_EXTENSION: &str = ".exe";

/// Split on the last `/` or `\`, whichever platform the path came from.
fn split_directory(path: &str) -> (&str, &str) {
    match path.rfind(['/', '\\']) {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => ("", path),
    }
}

/// Order `items` by directory group, first-seen first, then by lowercase
/// file name within each group.
pub fn sort_by_directory_then_name<T, F>(items: Vec<T>, path_of: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut groups: Vec<(String, Vec<(String, T)>)> = Vec::new();
    for item in items {
        let path = path_of(&item);
        let (directory, file_name) = split_directory(&path);
        let key = file_name.to_lowercase();
        match groups.iter_mut().find(|(dir, _)| dir == directory) {
            Some((_, members)) => members.push((key, item)),
            None => groups.push((directory.to_string(), vec![(key, item)])),
        }
    }

    groups
        .into_iter()
        .flat_map(|(_, mut members)| {
            members.sort_by(|a, b| a.0.cmp(&b.0));
            members.into_iter().map(|(_, item)| item)
        })
        .collect()
}

pub fn sort_plugin_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    sort_by_directory_then_name(paths, |path| path.to_string_lossy().into_owned())
}

/// Per-user directory searched for legacy providers.
pub fn default_legacy_directory() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join("NuGet").join("CredentialProviders"))
}

/// Builds legacy providers from `CredentialProvider*.exe` files.
pub struct PluginCredentialProviderBuilder<'a> {
    settings: &'a FeedAuthSettings,
    env: &'a dyn EnvironmentReader,
    default_directory: Option<PathBuf>,
}

impl<'a> PluginCredentialProviderBuilder<'a> {
    pub fn new(settings: &'a FeedAuthSettings, env: &'a dyn EnvironmentReader) -> Self {
        Self {
            settings,
            env,
            default_directory: default_legacy_directory(),
        }
    }

    /// Replace the per-user provider directory. `None` disables it.
    pub fn with_default_directory(mut self, directory: Option<PathBuf>) -> Self {
        self.default_directory = directory;
        self
    }

    /// Settings first, then the environment, then the default.
    pub fn timeout_seconds(&self) -> u64 {
        self.settings
            .credential_provider_timeout_seconds
            .filter(|seconds| *seconds > 0)
            .or_else(|| parse_seconds(self.env.var(CREDENTIAL_PROVIDER_TIMEOUT).as_deref()))
            .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECONDS)
    }

    fn search_directories(&self) -> Vec<PathBuf> {
        let mut directories = self.settings.legacy_provider_paths.clone();
        if let Some(raw) = self.env.var(CREDENTIAL_PROVIDERS_PATH) {
            directories.extend(
                raw.split(';')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(PathBuf::from),
            );
        }
        directories.extend(self.default_directory.clone());
        directories
    }

    /// Provider executables in search order, before sorting.
    pub fn discover_paths(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for directory in self.search_directories() {
            if !directory.is_dir() {
                debug!(directory = %directory.display(), "Skipping missing credential provider directory");
                continue;
            }
            for entry in WalkDir::new(&directory)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
            {
                if entry.file_type().is_file()
                    && is_legacy_provider(entry.path())
                    && seen.insert(entry.path().to_path_buf())
                {
                    paths.push(entry.into_path());
                }
            }
        }
        paths
    }

    pub fn build_all(&self) -> Vec<Arc<dyn CredentialProvider>> {
        let timeout = self.timeout_seconds();
        sort_plugin_paths(self.discover_paths())
            .into_iter()
            .map(|path| {
                debug!(path = %path.display(), timeout, "Legacy credential provider found");
                Arc::new(PluginCredentialProvider::new(path, timeout, self.settings.verbosity))
                    as Arc<dyn CredentialProvider>
            })
            .collect()
    }
}

fn is_legacy_provider(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .is_some_and(|name| name.starts_with(LEGACY_PREFIX) && name.ends_with(LEGACY_EXTENSION))
}

/// Builds one secure provider per discovered plugin.
pub struct SecurePluginCredentialProviderBuilder {
    manager: Arc<dyn PluginManager>,
    can_show_dialog: bool,
}

impl SecurePluginCredentialProviderBuilder {
    pub fn new(manager: Arc<dyn PluginManager>, can_show_dialog: bool) -> Self {
        Self {
            manager,
            can_show_dialog,
        }
    }

    pub async fn build_all(&self, cancel: &CancellationToken) -> Result<Vec<Arc<dyn CredentialProvider>>> {
        let discovered = self.manager.find_available_plugins(cancel).await?;
        let sorted = sort_by_directory_then_name(discovered.as_ref().clone(), |result| {
            result.path().to_string_lossy().into_owned()
        });

        Ok(sorted
            .into_iter()
            .map(|result| {
                Arc::new(SecurePluginCredentialProvider::new(
                    self.manager.clone(),
                    result,
                    self.can_show_dialog,
                )) as Arc<dyn CredentialProvider>
            })
            .collect())
    }
}

//! Secure plugin discovery.
//!
//! Plugins are located from a `;` separated list of files and directories,
//! or from the default plugin directories plus any `nuget-plugin-*`
//! executables on the search path when no list is configured. Discovery runs
//! once per discoverer; file state is validated lazily for files that exist.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PluginError, Result};
use crate::options::PluginFlavor;

/// File name prefix for plugins found by directory scanning.
pub const PLUGIN_FILE_PREFIX: &str = "nuget-plugin-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PluginFileState {
    NotFound,
    InvalidFilePath,
    InvalidEmbeddedSignature,
    Valid,
}

/// Checks the signature embedded in a plugin executable.
pub trait EmbeddedSignatureVerifier: Send + Sync {
    fn is_valid(&self, path: &Path) -> bool;
}

/// Verifier for platforms without embedded executable signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl EmbeddedSignatureVerifier for AcceptAllVerifier {
    fn is_valid(&self, _path: &Path) -> bool {
        true
    }
}

pub struct PluginFile {
    path: PathBuf,
    state: OnceLock<PluginFileState>,
    verifier: Option<Arc<dyn EmbeddedSignatureVerifier>>,
}

impl PluginFile {
    /// A file whose state is already known.
    pub fn with_state(path: impl Into<PathBuf>, state: PluginFileState) -> Self {
        Self {
            path: path.into(),
            state: OnceLock::from(state),
            verifier: None,
        }
    }

    /// An existing file whose signature is checked on first access.
    pub fn deferred(path: impl Into<PathBuf>, verifier: Arc<dyn EmbeddedSignatureVerifier>) -> Self {
        Self {
            path: path.into(),
            state: OnceLock::new(),
            verifier: Some(verifier),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> PluginFileState {
        *self.state.get_or_init(|| match &self.verifier {
            Some(verifier) if !verifier.is_valid(&self.path) => {
                PluginFileState::InvalidEmbeddedSignature
            }
            _ => PluginFileState::Valid,
        })
    }
}

impl fmt::Debug for PluginFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFile")
            .field("path", &self.path)
            .field("state", &self.state.get())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PluginDiscoveryResult {
    pub plugin_file: Arc<PluginFile>,
}

impl PluginDiscoveryResult {
    pub fn new(plugin_file: PluginFile) -> Self {
        Self {
            plugin_file: Arc::new(plugin_file),
        }
    }

    pub fn path(&self) -> &Path {
        self.plugin_file.path()
    }

    /// Explanation for any state other than [`PluginFileState::Valid`].
    pub fn message(&self) -> Option<String> {
        let path = self.plugin_file.path().display();
        match self.plugin_file.state() {
            PluginFileState::Valid => None,
            PluginFileState::NotFound => Some(format!("A plugin was not found at path '{}'.", path)),
            PluginFileState::InvalidFilePath => {
                Some(format!("The plugin file path '{}' is invalid.", path))
            }
            PluginFileState::InvalidEmbeddedSignature => Some(format!(
                "The plugin at '{}' did not have a valid embedded signature.",
                path
            )),
        }
    }
}

pub struct PluginDiscoverer {
    raw_paths: Option<String>,
    search_path: Option<String>,
    flavor: PluginFlavor,
    verifier: Arc<dyn EmbeddedSignatureVerifier>,
    results: OnceCell<Arc<Vec<PluginDiscoveryResult>>>,
}

impl PluginDiscoverer {
    pub fn new(
        raw_paths: Option<String>,
        flavor: PluginFlavor,
        verifier: Arc<dyn EmbeddedSignatureVerifier>,
    ) -> Self {
        Self {
            raw_paths,
            search_path: None,
            flavor,
            verifier,
            results: OnceCell::new(),
        }
    }

    /// `PATH`-style directory list scanned for `nuget-plugin-*` executables
    /// when no explicit plugin paths are configured.
    pub fn with_search_path(mut self, search_path: Option<String>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Discover plugins. Later calls return the first result.
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<PluginDiscoveryResult>>> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        let results = self
            .results
            .get_or_init(|| async { Arc::new(self.discover_now()) })
            .await;
        Ok(results.clone())
    }

    fn discover_now(&self) -> Vec<PluginDiscoveryResult> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();

        match &self.raw_paths {
            Some(raw) => {
                for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
                    self.add_entry(Path::new(entry), &mut seen, &mut files);
                }
            }
            None => {
                for root in default_plugin_roots(self.flavor) {
                    for path in scan_default_root(&root) {
                        self.add_file(path, &mut seen, &mut files);
                    }
                }
                if let Some(search_path) = &self.search_path {
                    for dir in std::env::split_paths(search_path) {
                        for path in scan_prefixed_executables(&dir) {
                            self.add_file(path, &mut seen, &mut files);
                        }
                    }
                }
            }
        }

        debug!(count = files.len(), "Plugin discovery completed");
        files
    }

    fn add_entry(
        &self,
        path: &Path,
        seen: &mut HashSet<PathBuf>,
        files: &mut Vec<PluginDiscoveryResult>,
    ) {
        if !path.is_absolute() {
            push_unique(
                PluginFile::with_state(path, PluginFileState::InvalidFilePath),
                seen,
                files,
            );
        } else if path.is_dir() {
            for file in scan_prefixed_executables(path) {
                self.add_file(file, seen, files);
            }
        } else if path.is_file() {
            self.add_file(path.to_path_buf(), seen, files);
        } else {
            push_unique(
                PluginFile::with_state(path, PluginFileState::NotFound),
                seen,
                files,
            );
        }
    }

    fn add_file(
        &self,
        path: PathBuf,
        seen: &mut HashSet<PathBuf>,
        files: &mut Vec<PluginDiscoveryResult>,
    ) {
        push_unique(PluginFile::deferred(path, self.verifier.clone()), seen, files);
    }
}

fn push_unique(
    file: PluginFile,
    seen: &mut HashSet<PathBuf>,
    files: &mut Vec<PluginDiscoveryResult>,
) {
    if seen.insert(file.path().to_path_buf()) {
        files.push(PluginDiscoveryResult::new(file));
    }
}

fn default_plugin_roots(flavor: PluginFlavor) -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| {
            vec![
                home.join(".nuget")
                    .join("plugins")
                    .join(flavor.directory_name()),
            ]
        })
        .unwrap_or_default()
}

/// Each plugin lives in its own directory next to a same-named executable.
fn scan_default_root(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .filter_map(|dir| {
            let name = dir.file_name()?.to_string_lossy().into_owned();
            [name.clone(), format!("{}.exe", name)]
                .into_iter()
                .map(|candidate| dir.join(candidate))
                .find(|candidate| candidate.is_file())
        })
        .collect()
}

fn scan_prefixed_executables(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|name| {
                    name.to_string_lossy()
                        .to_ascii_lowercase()
                        .starts_with(PLUGIN_FILE_PREFIX)
                })
                .unwrap_or(false)
        })
        .filter(|path| is_executable(path))
        .collect();
    found.sort();
    found
}

pub fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_ascii_lowercase();
                matches!(ext.as_str(), "exe" | "bat" | "cmd")
            })
            .unwrap_or(false)
    }
}

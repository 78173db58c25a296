//! Credential settings loaded from TOML.

use std::path::{Path, PathBuf};

use feedauth_plugins::{EnvironmentReader, PluginFlavor, PluginManagerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CredentialError, Result};
use crate::legacy::Verbosity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedAuthSettings {
    /// Timeout for legacy providers. Takes precedence over the environment.
    pub credential_provider_timeout_seconds: Option<u64>,
    /// Extra directories searched for legacy providers.
    pub legacy_provider_paths: Vec<PathBuf>,
    /// `;` separated secure plugin paths, overriding the environment.
    pub plugin_paths: Option<String>,
    /// Where operation claims are persisted between runs.
    pub plugins_cache_dir: Option<PathBuf>,
    pub verbosity: Verbosity,
    pub non_interactive: bool,
    pub can_show_dialog: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for FeedAuthSettings {
    fn default() -> Self {
        Self {
            credential_provider_timeout_seconds: None,
            legacy_provider_paths: Vec::new(),
            plugin_paths: None,
            plugins_cache_dir: default_cache_dir(),
            verbosity: Verbosity::Normal,
            non_interactive: false,
            can_show_dialog: true,
            log_dir: None,
        }
    }
}

impl FeedAuthSettings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("feedauth").join("config.toml"))
    }

    /// Load from `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|err| CredentialError::Settings(format!("{}: {}", path.display(), err)))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| CredentialError::Settings(err.to_string()))
    }

    /// Secure plugin manager configuration: environment first, then these
    /// settings on top.
    pub fn plugin_manager_config(
        &self,
        env: &dyn EnvironmentReader,
        flavor: PluginFlavor,
    ) -> PluginManagerConfig {
        let mut config = PluginManagerConfig::from_env(env, flavor);
        if let Some(paths) = self.plugin_paths.as_ref().filter(|p| !p.trim().is_empty()) {
            config.raw_plugin_paths = Some(paths.clone());
        }
        config.cache_dir = self.plugins_cache_dir.clone();
        config
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|p| p.join("feedauth").join("plugins-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedauth_plugins::MapEnvironment;
    use feedauth_plugins::env::PLUGIN_PATHS;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = FeedAuthSettings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings, FeedAuthSettings::default());
        assert!(settings.can_show_dialog);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "credential_provider_timeout_seconds = 42\nverbosity = \"detailed\"\nlegacy_provider_paths = [\"/opt/providers\"]\n",
        )
        .unwrap();

        let settings = FeedAuthSettings::load(Some(&path)).unwrap();

        assert_eq!(settings.credential_provider_timeout_seconds, Some(42));
        assert_eq!(settings.verbosity, Verbosity::Detailed);
        assert_eq!(settings.legacy_provider_paths, vec![PathBuf::from("/opt/providers")]);
        assert!(!settings.non_interactive);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "verbosity = 3").unwrap();

        let err = FeedAuthSettings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, CredentialError::Settings(_)));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let settings = FeedAuthSettings {
            plugin_paths: Some("/a;/b".to_string()),
            ..FeedAuthSettings::default()
        };
        let parsed: FeedAuthSettings = toml::from_str(&settings.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_settings_paths_override_environment() {
        let env = MapEnvironment::new().with(PLUGIN_PATHS, "/from/env");

        let from_env = FeedAuthSettings::default().plugin_manager_config(&env, PluginFlavor::Core);
        assert_eq!(from_env.raw_plugin_paths.as_deref(), Some("/from/env"));

        let settings = FeedAuthSettings {
            plugin_paths: Some("/from/settings".to_string()),
            plugins_cache_dir: None,
            ..FeedAuthSettings::default()
        };
        let config = settings.plugin_manager_config(&env, PluginFlavor::Core);
        assert_eq!(config.raw_plugin_paths.as_deref(), Some("/from/settings"));
        assert!(config.cache_dir.is_none());
    }
}

//! Connection and manager options resolved from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::env::{self, EnvironmentReader};
use crate::messages::ProtocolVersion;

pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(2, 0, 0);
pub const MINIMUM_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Which plugin set the host loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PluginFlavor {
    #[default]
    Core,
    Desktop,
}

impl PluginFlavor {
    /// Flavor-specific path variable, consulted before the generic one.
    pub fn paths_variable(self) -> &'static str {
        match self {
            PluginFlavor::Core => env::NETCORE_PLUGIN_PATHS,
            PluginFlavor::Desktop => env::NETFX_PLUGIN_PATHS,
        }
    }

    pub fn directory_name(self) -> &'static str {
        match self {
            PluginFlavor::Core => "netcore",
            PluginFlavor::Desktop => "netfx",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub protocol_version: ProtocolVersion,
    pub minimum_protocol_version: ProtocolVersion,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            minimum_protocol_version: MINIMUM_PROTOCOL_VERSION,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    pub fn from_env(reader: &dyn EnvironmentReader) -> Self {
        Self {
            handshake_timeout: env::timeout_from_env(
                reader,
                env::PLUGIN_HANDSHAKE_TIMEOUT,
                DEFAULT_HANDSHAKE_TIMEOUT,
            ),
            request_timeout: env::timeout_from_env(
                reader,
                env::PLUGIN_REQUEST_TIMEOUT,
                DEFAULT_REQUEST_TIMEOUT,
            ),
            ..Self::default()
        }
    }

    pub fn supports(&self, version: ProtocolVersion) -> bool {
        version >= self.minimum_protocol_version && version <= self.protocol_version
    }
}

/// Configuration for [`crate::SharedPluginManager`].
#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    /// Raw `;` separated plugin paths. `None` means scan the default directories.
    pub raw_plugin_paths: Option<String>,
    /// `PATH`-style list scanned for `nuget-plugin-*` when no paths are configured.
    pub search_path: Option<String>,
    pub flavor: PluginFlavor,
    pub connection: ConnectionOptions,
    pub idle_timeout: Duration,
    /// Directory for persisted operation claims. `None` keeps claims in memory only.
    pub cache_dir: Option<PathBuf>,
    pub client_version: String,
    pub culture: String,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            raw_plugin_paths: None,
            search_path: None,
            flavor: PluginFlavor::default(),
            connection: ConnectionOptions::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cache_dir: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            culture: "en-US".to_string(),
        }
    }
}

impl PluginManagerConfig {
    pub fn from_env(reader: &dyn EnvironmentReader, flavor: PluginFlavor) -> Self {
        let raw_plugin_paths = reader
            .var(flavor.paths_variable())
            .or_else(|| reader.var(env::PLUGIN_PATHS))
            .filter(|paths| !paths.trim().is_empty());

        Self {
            raw_plugin_paths,
            search_path: reader.var("PATH"),
            flavor,
            connection: ConnectionOptions::from_env(reader),
            idle_timeout: env::timeout_from_env(reader, env::PLUGIN_IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT),
            ..Self::default()
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnvironment;

    #[test]
    fn test_flavor_specific_paths_win() {
        let env = MapEnvironment::new()
            .with(env::PLUGIN_PATHS, "/generic/plugin")
            .with(env::NETCORE_PLUGIN_PATHS, "/core/plugin");

        let core = PluginManagerConfig::from_env(&env, PluginFlavor::Core);
        assert_eq!(core.raw_plugin_paths.as_deref(), Some("/core/plugin"));

        let desktop = PluginManagerConfig::from_env(&env, PluginFlavor::Desktop);
        assert_eq!(desktop.raw_plugin_paths.as_deref(), Some("/generic/plugin"));
    }

    #[test]
    fn test_timeouts_read_from_env() {
        let env = MapEnvironment::new()
            .with(env::PLUGIN_HANDSHAKE_TIMEOUT, "3")
            .with(env::PLUGIN_REQUEST_TIMEOUT, "-1")
            .with(env::PLUGIN_IDLE_TIMEOUT, "7");
        let config = PluginManagerConfig::from_env(&env, PluginFlavor::Core);

        assert_eq!(config.connection.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.connection.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.idle_timeout, Duration::from_secs(7));
        assert!(config.raw_plugin_paths.is_none());
    }

    #[test]
    fn test_supported_version_range() {
        let options = ConnectionOptions::default();
        assert!(options.supports(ProtocolVersion::new(1, 0, 0)));
        assert!(options.supports(ProtocolVersion::new(2, 0, 0)));
        assert!(!options.supports(ProtocolVersion::new(3, 0, 0)));
        assert!(!options.supports(ProtocolVersion::new(0, 9, 0)));
    }
}

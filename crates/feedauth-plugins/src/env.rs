//! Environment variable access.
//!
//! Everything that consults the process environment goes through
//! [`EnvironmentReader`] so tests can supply a fixed map instead of mutating
//! global state.

use std::collections::HashMap;
use std::time::Duration;

/// Generic list of secure plugin paths, `;` separated.
pub const PLUGIN_PATHS: &str = "NUGET_PLUGIN_PATHS";
/// Secure plugin paths for hosts running the core flavor.
pub const NETCORE_PLUGIN_PATHS: &str = "NUGET_NETCORE_PLUGIN_PATHS";
/// Secure plugin paths for hosts running the desktop flavor.
pub const NETFX_PLUGIN_PATHS: &str = "NUGET_NETFX_PLUGIN_PATHS";
pub const PLUGIN_HANDSHAKE_TIMEOUT: &str = "NUGET_PLUGIN_HANDSHAKE_TIMEOUT_IN_SECONDS";
pub const PLUGIN_REQUEST_TIMEOUT: &str = "NUGET_PLUGIN_REQUEST_TIMEOUT_IN_SECONDS";
pub const PLUGIN_IDLE_TIMEOUT: &str = "NUGET_PLUGIN_IDLE_TIMEOUT_IN_SECONDS";
/// Directories searched for legacy `CredentialProvider*.exe` executables.
pub const CREDENTIAL_PROVIDERS_PATH: &str = "NUGET_CREDENTIALPROVIDERS_PATH";
pub const CREDENTIAL_PROVIDER_TIMEOUT: &str = "NUGET_CREDENTIAL_PROVIDER_TIMEOUT_SECONDS";

pub trait EnvironmentReader: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl EnvironmentReader for SystemEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed set of variables.
#[derive(Debug, Default, Clone)]
pub struct MapEnvironment {
    vars: HashMap<String, String>,
}

impl MapEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvironmentReader for MapEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Parse a positive whole number of seconds.
///
/// Missing, malformed, zero and negative values all yield `None`.
pub fn parse_seconds(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .map(|secs| secs as u64)
}

/// Timeout from `name`, or `default` when the variable is unusable.
pub fn timeout_from_env(env: &dyn EnvironmentReader, name: &str, default: Duration) -> Duration {
    parse_seconds(env.var(name).as_deref())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

//! Assembles the provider list used by [`CredentialService`].

use std::path::PathBuf;
use std::sync::Arc;

use feedauth_plugins::{EnvironmentReader, PluginManager};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::builder::{
    PluginCredentialProviderBuilder, SecurePluginCredentialProviderBuilder, default_legacy_directory,
};
use crate::error::Result;
use crate::service::{CredentialService, ProviderList, ProviderLoader};
use crate::settings::FeedAuthSettings;

/// Secure plugin providers first, then legacy providers.
pub struct CredentialProviders {
    settings: FeedAuthSettings,
    env: Arc<dyn EnvironmentReader>,
    manager: Arc<dyn PluginManager>,
    legacy_default_directory: Option<PathBuf>,
}

impl CredentialProviders {
    pub fn new(
        settings: FeedAuthSettings,
        env: Arc<dyn EnvironmentReader>,
        manager: Arc<dyn PluginManager>,
    ) -> Self {
        Self {
            settings,
            env,
            manager,
            legacy_default_directory: default_legacy_directory(),
        }
    }

    pub fn with_legacy_default_directory(mut self, directory: Option<PathBuf>) -> Self {
        self.legacy_default_directory = directory;
        self
    }

    pub fn settings(&self) -> &FeedAuthSettings {
        &self.settings
    }

    pub async fn load(&self, cancel: &CancellationToken) -> Result<ProviderList> {
        let mut providers = SecurePluginCredentialProviderBuilder::new(
            self.manager.clone(),
            self.settings.can_show_dialog,
        )
        .build_all(cancel)
        .await?;
        let secure = providers.len();

        providers.extend(
            PluginCredentialProviderBuilder::new(&self.settings, self.env.as_ref())
                .with_default_directory(self.legacy_default_directory.clone())
                .build_all(),
        );
        info!(
            secure,
            legacy = providers.len() - secure,
            "Credential providers loaded"
        );
        Ok(providers)
    }

    pub fn into_loader(self) -> ProviderLoader {
        let this = Arc::new(self);
        Box::new(move |cancel| {
            let this = this.clone();
            async move { this.load(&cancel).await }.boxed()
        })
    }

    /// Service resolving these providers on first use.
    pub fn into_service(self) -> CredentialService {
        let non_interactive = self.settings.non_interactive;
        CredentialService::new(self.into_loader(), non_interactive, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedauth_plugins::env::CREDENTIAL_PROVIDERS_PATH;
    use feedauth_plugins::testkit::{FakePluginLauncher, FakePluginScript};
    use feedauth_plugins::{AcceptAllVerifier, MapEnvironment, PluginManagerConfig, SharedPluginManager};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_secure_providers_come_first() {
        let dir = TempDir::new().unwrap();
        let legacy_dir = dir.path().join("legacy");
        let plugin = dir.path().join("secure").join("nuget-plugin-feed");
        std::fs::create_dir_all(&legacy_dir).unwrap();
        std::fs::create_dir_all(plugin.parent().unwrap()).unwrap();
        std::fs::write(legacy_dir.join("CredentialProvider.Feed.exe"), b"").unwrap();
        std::fs::write(&plugin, b"").unwrap();

        let config = PluginManagerConfig {
            raw_plugin_paths: Some(plugin.display().to_string()),
            ..PluginManagerConfig::default()
        };
        let manager = Arc::new(SharedPluginManager::new(
            config,
            Arc::new(FakePluginLauncher::new(FakePluginScript::default())),
            Arc::new(AcceptAllVerifier),
        ));
        let env = Arc::new(
            MapEnvironment::new().with(CREDENTIAL_PROVIDERS_PATH, legacy_dir.display().to_string()),
        );

        let providers = CredentialProviders::new(FeedAuthSettings::default(), env, manager)
            .with_legacy_default_directory(None)
            .load(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(providers.len(), 2);
        assert!(providers[0].id().starts_with("SecurePluginCredentialProvider_"));
        assert!(providers[1].id().starts_with("PluginCredentialProvider_CredentialProvider.Feed.exe_"));
    }
}

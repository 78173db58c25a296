//! Plugin manager: discovery, one-time initialization and operation claims.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::claims_cache::ClaimsCacheStore;
use crate::connection::PluginConnection;
use crate::discovery::{
    AcceptAllVerifier, EmbeddedSignatureVerifier, PluginDiscoverer, PluginDiscoveryResult,
};
use crate::env::EnvironmentReader;
use crate::error::{PluginError, Result};
use crate::factory::{Plugin, PluginFactory, PluginLauncher, PluginLease, ProcessLauncher};
use crate::messages::{
    GetOperationClaimsRequest, GetOperationClaimsResponse, InitializeRequest, MessageMethod,
    MessageResponseCode, MonitorNuGetProcessExitRequest, OperationClaim, ResponseCodePayload,
};
use crate::options::{PluginFlavor, PluginManagerConfig};

const INITIALIZE_ONCE_KEY: &str = "initialize";

/// A running plugin known to support the requested claim.
pub struct PluginHandle {
    lease: PluginLease,
    claims: Vec<OperationClaim>,
}

impl PluginHandle {
    pub fn plugin(&self) -> &Arc<Plugin> {
        self.lease.plugin()
    }

    pub fn connection(&self) -> &PluginConnection {
        self.lease.plugin().connection()
    }

    pub fn claims(&self) -> &[OperationClaim] {
        &self.claims
    }
}

/// Outcome of asking for a source-agnostic plugin.
pub enum SourceAgnosticPlugin {
    Available(PluginHandle),
    /// The plugin does not advertise the requested claim.
    ClaimNotSupported,
    /// The plugin is unusable. `message` is suitable for users.
    Failed {
        message: String,
        error: Option<PluginError>,
    },
}

#[async_trait]
pub trait PluginManager: Send + Sync {
    async fn find_available_plugins(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<PluginDiscoveryResult>>>;

    /// Obtain the plugin from `discovery` if it supports `claim`.
    ///
    /// Only cancellation is returned as an error; every other failure is
    /// reported through [`SourceAgnosticPlugin::Failed`].
    async fn try_get_source_agnostic_plugin(
        &self,
        discovery: &PluginDiscoveryResult,
        claim: &OperationClaim,
        cancel: &CancellationToken,
    ) -> Result<SourceAgnosticPlugin>;
}

/// Plugin manager sharing one process per executable between all callers.
pub struct SharedPluginManager {
    config: PluginManagerConfig,
    discoverer: PluginDiscoverer,
    factory: PluginFactory,
    source_agnostic_claims: DashMap<PathBuf, Vec<OperationClaim>>,
    claims_store: Option<ClaimsCacheStore>,
}

impl SharedPluginManager {
    pub fn new(
        config: PluginManagerConfig,
        launcher: Arc<dyn PluginLauncher>,
        verifier: Arc<dyn EmbeddedSignatureVerifier>,
    ) -> Self {
        let discoverer = PluginDiscoverer::new(config.raw_plugin_paths.clone(), config.flavor, verifier)
            .with_search_path(config.search_path.clone());
        let factory = PluginFactory::new(launcher, config.idle_timeout);
        let claims_store = config.cache_dir.clone().map(ClaimsCacheStore::new);

        Self {
            config,
            discoverer,
            factory,
            source_agnostic_claims: DashMap::new(),
            claims_store,
        }
    }

    /// Manager for real plugin processes configured from the environment.
    pub fn from_env(reader: &dyn EnvironmentReader, flavor: PluginFlavor) -> Self {
        Self::new(
            PluginManagerConfig::from_env(reader, flavor),
            Arc::new(ProcessLauncher),
            Arc::new(AcceptAllVerifier),
        )
    }

    pub fn config(&self) -> &PluginManagerConfig {
        &self.config
    }

    pub fn factory(&self) -> &PluginFactory {
        &self.factory
    }

    /// Close every running plugin.
    pub fn shutdown(&self) {
        self.factory.shutdown();
    }

    fn cached_claims(&self, path: &Path) -> Option<Vec<OperationClaim>> {
        if let Some(claims) = self.source_agnostic_claims.get(path) {
            return Some(claims.value().clone());
        }
        let claims = self.claims_store.as_ref()?.load(path)?;
        debug!(path = %path.display(), "Operation claims loaded from cache");
        self.source_agnostic_claims
            .insert(path.to_path_buf(), claims.clone());
        Some(claims)
    }

    fn remember_claims(&self, path: &Path, claims: &[OperationClaim]) {
        self.source_agnostic_claims
            .insert(path.to_path_buf(), claims.to_vec());
        if let Some(store) = &self.claims_store
            && let Err(err) = store.store(path, claims)
        {
            warn!(error = %err, path = %path.display(), "Failed to persist operation claims");
        }
    }

    async fn start_plugin(&self, path: &Path, cancel: &CancellationToken) -> Result<PluginHandle> {
        let lease = self
            .factory
            .get_or_create(path, &self.config.connection, cancel)
            .await?;
        let plugin = lease.plugin().clone();

        plugin
            .utilities()
            .do_once(INITIALIZE_ONCE_KEY, || self.initialize(&plugin, cancel))
            .await?;

        let claims = match self.cached_claims(path) {
            Some(claims) => claims,
            None => {
                let response: GetOperationClaimsResponse = plugin
                    .connection()
                    .send_request(
                        MessageMethod::GetOperationClaims,
                        &GetOperationClaimsRequest::default(),
                        cancel,
                    )
                    .await?;
                self.remember_claims(path, &response.claims);
                response.claims
            }
        };

        Ok(PluginHandle { lease, claims })
    }

    async fn initialize(&self, plugin: &Plugin, cancel: &CancellationToken) -> Result<()> {
        let connection = plugin.connection();

        let _: ResponseCodePayload = connection
            .send_request(
                MessageMethod::MonitorNuGetProcessExit,
                &MonitorNuGetProcessExitRequest {
                    process_id: std::process::id(),
                },
                cancel,
            )
            .await?;

        let request = InitializeRequest {
            client_version: self.config.client_version.clone(),
            culture: self.config.culture.clone(),
            request_timeout: self.config.connection.request_timeout,
        };
        let response: ResponseCodePayload = connection
            .send_request(MessageMethod::Initialize, &request, cancel)
            .await?;
        if response.response_code != MessageResponseCode::Success {
            return Err(PluginError::Initialization);
        }

        connection.set_request_timeout(self.config.connection.request_timeout);
        debug!(path = %plugin.file_path().display(), "Plugin initialized");
        Ok(())
    }
}

#[async_trait]
impl PluginManager for SharedPluginManager {
    async fn find_available_plugins(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<PluginDiscoveryResult>>> {
        self.discoverer.discover(cancel).await
    }

    async fn try_get_source_agnostic_plugin(
        &self,
        discovery: &PluginDiscoveryResult,
        claim: &OperationClaim,
        cancel: &CancellationToken,
    ) -> Result<SourceAgnosticPlugin> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if let Some(message) = discovery.message() {
            return Ok(SourceAgnosticPlugin::Failed {
                message,
                error: None,
            });
        }

        let path = discovery.path();
        if let Some(claims) = self.cached_claims(path)
            && !claims.contains(claim)
        {
            debug!(path = %path.display(), %claim, "Plugin does not claim operation");
            return Ok(SourceAgnosticPlugin::ClaimNotSupported);
        }

        match self.start_plugin(path, cancel).await {
            Ok(handle) if handle.claims.contains(claim) => Ok(SourceAgnosticPlugin::Available(handle)),
            Ok(_) => Ok(SourceAgnosticPlugin::ClaimNotSupported),
            Err(PluginError::Cancelled) => Err(PluginError::Cancelled),
            Err(err) => Ok(SourceAgnosticPlugin::Failed {
                message: format!("Problem starting the plugin '{}'. {}", path.display(), err),
                error: Some(err),
            }),
        }
    }
}

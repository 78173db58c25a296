//! Credential provider backed by a long-lived secure plugin.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use feedauth_plugins::messages::{ResponseCodePayload, SetLogLevelRequest};
use feedauth_plugins::{
    GetAuthenticationCredentialsRequest, GetAuthenticationCredentialsResponse, LogLevel,
    LogRequestHandler, MessageMethod, MessageResponseCode, OperationClaim, PluginDiscoveryResult,
    PluginHandle, PluginManager, SetCredentialsRequest, SourceAgnosticPlugin,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{CredentialError, Result};
use crate::provider::{CredentialProvider, CredentialRequest};
use crate::types::{CredentialResponse, Credentials, NetworkCredential};

const SET_LOG_LEVEL_ONCE_KEY: &str = "set-log-level";

pub struct SecurePluginCredentialProvider {
    id: String,
    manager: Arc<dyn PluginManager>,
    discovery: PluginDiscoveryResult,
    can_show_dialog: bool,
    /// Whether the plugin claims `Authentication`, once known.
    authentication_supported: OnceLock<bool>,
}

impl SecurePluginCredentialProvider {
    pub fn new(
        manager: Arc<dyn PluginManager>,
        discovery: PluginDiscoveryResult,
        can_show_dialog: bool,
    ) -> Self {
        Self {
            id: format!("SecurePluginCredentialProvider_{}", discovery.path().display()),
            manager,
            discovery,
            can_show_dialog,
            authentication_supported: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        self.discovery.path()
    }

    pub fn can_show_dialog(&self) -> bool {
        self.can_show_dialog
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<Option<PluginHandle>> {
        let outcome = self
            .manager
            .try_get_source_agnostic_plugin(&self.discovery, &OperationClaim::Authentication, cancel)
            .await?;

        match outcome {
            SourceAgnosticPlugin::Available(handle) => {
                let _ = self.authentication_supported.set(true);
                Ok(Some(handle))
            }
            SourceAgnosticPlugin::ClaimNotSupported => {
                let _ = self.authentication_supported.set(false);
                Ok(None)
            }
            SourceAgnosticPlugin::Failed { message, error } => {
                error!(path = %self.path().display(), "{}", message);
                if let Some(err) = &error {
                    debug!(path = %self.path().display(), error = ?err, "Plugin creation failed");
                }
                Err(CredentialError::Plugin {
                    message,
                    source: error.map(|err| Box::new(err) as _),
                })
            }
        }
    }

    fn map_response(&self, response: GetAuthenticationCredentialsResponse) -> CredentialResponse {
        match response.response_code {
            MessageResponseCode::Success if response.is_valid() => {
                let credential = NetworkCredential::new(
                    response.username.unwrap_or_default(),
                    response.password.unwrap_or_default(),
                );
                let credentials = match response.authentication_types {
                    Some(types) if !types.is_empty() => Credentials::with_auth_types(credential, types),
                    _ => Credentials::new(credential),
                };
                CredentialResponse::success(credentials)
            }
            MessageResponseCode::NotFound => CredentialResponse::user_canceled(),
            code => {
                warn!(
                    path = %self.path().display(),
                    response_code = ?code,
                    message = response.message.as_deref().unwrap_or_default(),
                    "Credential plugin did not return usable credentials"
                );
                CredentialResponse::not_applicable()
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for SecurePluginCredentialProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get(
        &self,
        request: &CredentialRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CredentialResponse> {
        if self.authentication_supported.get() == Some(&false) {
            return Ok(CredentialResponse::not_applicable());
        }

        let Some(handle) = self.acquire(cancel).await? else {
            return Ok(CredentialResponse::not_applicable());
        };
        let plugin = handle.plugin();
        let connection = plugin.connection();

        connection
            .handlers()
            .try_add(MessageMethod::Log, Arc::new(LogRequestHandler::new(plugin.file_path())));

        plugin
            .utilities()
            .do_once(SET_LOG_LEVEL_ONCE_KEY, || async {
                let _: ResponseCodePayload = connection
                    .send_request(
                        MessageMethod::SetLogLevel,
                        &SetLogLevelRequest {
                            log_level: LogLevel::from_tracing(),
                        },
                        cancel,
                    )
                    .await?;
                Ok(())
            })
            .await?;

        if let Some(proxy_credentials) = request.proxy.and_then(|proxy| proxy.credentials()) {
            let _: ResponseCodePayload = connection
                .send_request(
                    MessageMethod::SetCredentials,
                    &SetCredentialsRequest {
                        package_source_repository: request.uri.path().to_string(),
                        proxy_username: Some(proxy_credentials.username().to_string()),
                        proxy_password: Some(proxy_credentials.password().to_string()),
                        username: None,
                        password: None,
                    },
                    cancel,
                )
                .await?;
        }

        let response: GetAuthenticationCredentialsResponse = connection
            .send_request(
                MessageMethod::GetAuthenticationCredentials,
                &GetAuthenticationCredentialsRequest {
                    uri: request.uri.to_string(),
                    is_retry: request.is_retry,
                    is_non_interactive: request.non_interactive,
                    can_show_dialog: self.can_show_dialog,
                },
                cancel,
            )
            .await?;
        debug!(
            path = %self.path().display(),
            response_code = ?response.response_code,
            "Credential plugin responded"
        );

        Ok(self.map_response(response))
    }
}

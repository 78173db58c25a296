use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::Verbosity;
use super::runner::{PluginOutput, PluginProcessRunner, TokioProcessRunner};
use crate::error::{CredentialError, Result};
use crate::provider::{CredentialProvider, CredentialRequest};
use crate::types::{CredentialResponse, Credentials, NetworkCredential};

/// Exit codes understood from legacy plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    ProviderNotApplicable,
    Failure,
}

impl ExitCode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::ProviderNotApplicable),
            2 => Some(ExitCode::Failure),
            _ => None,
        }
    }
}

/// Result of one plugin run. An unrecognized exit code is not yet an error:
/// the caller decides whether a retry without `-verbosity` is due.
#[derive(Debug)]
enum PluginOutcome {
    Response(CredentialResponse),
    UnexpectedStatus(i32),
}

/// Credential provider backed by a legacy plugin executable.
pub struct PluginCredentialProvider {
    id: String,
    path: PathBuf,
    timeout: Duration,
    verbosity: Verbosity,
    runner: Arc<dyn PluginProcessRunner>,
}

impl PluginCredentialProvider {
    pub fn new(path: impl Into<PathBuf>, timeout_seconds: u64, verbosity: Verbosity) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: format!("PluginCredentialProvider_{}_{}", file_name, uuid::Uuid::new_v4()),
            path,
            timeout: Duration::from_secs(timeout_seconds),
            verbosity,
            runner: Arc::new(TokioProcessRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn PluginProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Plugin arguments for one request. `-verbosity` is left out at the
    /// default level.
    pub fn command_line(
        uri: &Url,
        is_retry: bool,
        non_interactive: bool,
        verbosity: Verbosity,
    ) -> Vec<String> {
        let mut args = vec!["-uri".to_string(), uri.as_str().to_string()];
        if is_retry {
            args.push("-isRetry".to_string());
        }
        if non_interactive {
            args.push("-nonInteractive".to_string());
        }
        if verbosity != Verbosity::Normal {
            args.push("-verbosity".to_string());
            args.push(verbosity.to_string());
        }
        args
    }

    async fn execute(
        &self,
        request: &CredentialRequest<'_>,
        verbosity: Verbosity,
        cancel: &CancellationToken,
    ) -> Result<PluginOutcome> {
        let args = Self::command_line(
            request.uri,
            request.is_retry,
            request.non_interactive,
            verbosity,
        );
        debug!(path = %self.path.display(), args = ?args, "Running credential plugin");

        let PluginOutput { exit_code, stdout } = self
            .runner
            .run(&self.path, &args, self.timeout, cancel)
            .await?;

        match ExitCode::from_code(exit_code) {
            Some(ExitCode::Success) => {
                let credentials = self.parse_credentials(&stdout)?;
                Ok(PluginOutcome::Response(CredentialResponse::success(credentials)))
            }
            Some(ExitCode::ProviderNotApplicable) => {
                Ok(PluginOutcome::Response(CredentialResponse::not_applicable()))
            }
            Some(ExitCode::Failure) => {
                let mut message = format!(
                    "Credential plugin {} handles this request, but is unable to provide credentials.",
                    self.path.display()
                );
                if let Some(extra) = payload_message(&stdout) {
                    message.push(' ');
                    message.push_str(&extra);
                }
                Err(CredentialError::plugin(message))
            }
            None => Ok(PluginOutcome::UnexpectedStatus(exit_code)),
        }
    }

    /// Parse a success payload. Errors never carry payload text, which may
    /// hold a password.
    fn parse_credentials(&self, stdout: &str) -> Result<Credentials> {
        let invalid = || {
            CredentialError::plugin(format!(
                "Credential plugin {} handles this request, but the payload was not valid.",
                self.path.display()
            ))
        };

        let payload = match serde_json::from_str::<Value>(stdout) {
            Ok(Value::Object(map)) => map,
            _ => return Err(invalid()),
        };

        let username = optional_string(&payload, "Username").map_err(|_| invalid())?;
        let password = optional_string(&payload, "Password").map_err(|_| invalid())?;
        let auth_types = match field(&payload, "AuthTypes") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) if !items.is_empty() => {
                let types = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(invalid)?;
                Some(types)
            }
            Some(_) => return Err(invalid()),
        };

        let username = username.unwrap_or_default();
        let password = password.unwrap_or_default();
        if username.is_empty() && password.is_empty() {
            return Err(invalid());
        }

        if let Some(message) = optional_string(&payload, "Message").ok().flatten()
            && !message.is_empty()
        {
            debug!(path = %self.path.display(), message = %message, "Credential plugin message");
        }

        let credential = NetworkCredential::new(username, password);
        Ok(match auth_types {
            Some(types) => Credentials::with_auth_types(credential, types),
            None => Credentials::new(credential),
        })
    }
}

#[async_trait]
impl CredentialProvider for PluginCredentialProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get(
        &self,
        request: &CredentialRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CredentialResponse> {
        if request.request_type.is_proxy() {
            return Ok(CredentialResponse::not_applicable());
        }

        let exit_code = match self.execute(request, self.verbosity, cancel).await? {
            PluginOutcome::Response(response) => return Ok(response),
            PluginOutcome::UnexpectedStatus(code) => code,
        };

        let exit_code = if self.verbosity != Verbosity::Normal {
            warn!(
                path = %self.path.display(),
                exit_code,
                "Credential plugin exited unexpectedly, retrying without -verbosity"
            );
            match self.execute(request, Verbosity::Normal, cancel).await? {
                PluginOutcome::Response(response) => return Ok(response),
                PluginOutcome::UnexpectedStatus(code) => code,
            }
        } else {
            exit_code
        };

        Err(CredentialError::UnexpectedStatus {
            path: self.path.clone(),
            exit_code,
        })
    }
}

fn field<'a>(payload: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    payload
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn optional_string(payload: &Map<String, Value>, name: &str) -> std::result::Result<Option<String>, ()> {
    match field(payload, name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(()),
    }
}

fn payload_message(stdout: &str) -> Option<String> {
    match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Object(map)) => optional_string(&map, "Message")
            .ok()
            .flatten()
            .filter(|message| !message.is_empty()),
        _ => None,
    }
}
